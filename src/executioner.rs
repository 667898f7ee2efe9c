//! Query execution over intermediate results.
//!
//! The executioner walks a query's predicates in order. Every relation a
//! predicate touches is pulled into an [`Entity`]: the row-aligned surviving
//! keys of a connected group of relations. Filters prune entity rows, joins
//! either create, extend or merge entities, and once every predicate ran the
//! remaining entities are combined and checksummed.
//!
//! ```text
//!  predicate            store before            store after
//!  A.p > 3              {}                      {[A]}
//!  A.p = B.p            {[A]}                   {[A B]}         semi-internal
//!  C.p = D.p            {[A B]}                 {[A B] [C D]}   external
//!  B.p = C.p            {[A B] [C D]}           {[A B C D]}     internal
//!  A.k < D.p            {[A B C D]}             {[A B C D]}     internal self
//! ```
use std::collections::{BTreeMap, HashMap};
use std::iter;

use tracing::{debug, debug_span};

use crate::config::JoinConfig;
use crate::error::{Error, Result};
use crate::index::{nested_loop_join, radix_join};
use crate::query::{Checksum, Comparison, Operand, Query, Rhs};
use crate::relation::{Relation, RelationId, Tuple};
use crate::result::ResultList;

/// Surviving keys of a connected group of relations.
///
/// Row `i` of every column belongs to the same logical result row, so columns
/// only ever shrink or get re-gathered together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entity {
    rows: usize,
    columns: BTreeMap<RelationId, Vec<u64>>,
}

impl Entity {
    fn single(relation: RelationId, keys: Vec<u64>) -> Self {
        Self {
            rows: keys.len(),
            columns: BTreeMap::from([(relation, keys)]),
        }
    }

    /// Number of relations represented.
    pub fn column_num(&self) -> usize {
        self.columns.len()
    }

    /// Number of surviving rows, shared by every column.
    pub fn column_size(&self) -> usize {
        self.rows
    }

    pub fn column(&self, relation: RelationId) -> Option<&[u64]> {
        self.columns.get(&relation).map(Vec::as_slice)
    }

    pub fn relations(&self) -> impl Iterator<Item = RelationId> + '_ {
        self.columns.keys().copied()
    }

    fn keys(&self, relation: RelationId) -> Result<&[u64]> {
        self.column(relation)
            .ok_or(Error::UntrackedRelation(relation))
    }

    /// Drops every row whose `keep` flag is false, from all columns at once.
    fn retain_rows(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.rows);
        for column in self.columns.values_mut() {
            let mut flags = keep.iter();
            column.retain(|_| flags.next().copied().unwrap_or(false));
        }
        self.rows = keep.iter().filter(|&&k| k).count();
    }

    /// `(row position, value)` tuples of one operand, the shape the join
    /// kernels consume.
    fn positional(&self, relation: &Relation, operand: Operand) -> Result<Vec<Tuple>> {
        Ok(self
            .keys(operand.relation)?
            .iter()
            .enumerate()
            .map(|(row, &key)| Tuple::new(row as u64, relation.value(key, operand.column)))
            .collect())
    }
}

/// Combines `left` and `right` into one entity whose rows are `(l, r)` row
/// position pairs of the two inputs.
fn combine<L, R>(left: &Entity, right: &Entity, left_rows: L, right_rows: R, rows: usize) -> Entity
where
    L: Iterator<Item = usize> + Clone,
    R: Iterator<Item = usize> + Clone,
{
    let mut columns: BTreeMap<RelationId, Vec<u64>> = BTreeMap::new();
    for (&relation, keys) in &left.columns {
        columns.insert(relation, left_rows.clone().map(|i| keys[i]).collect());
    }
    for (&relation, keys) in &right.columns {
        columns.insert(relation, right_rows.clone().map(|i| keys[i]).collect());
    }
    Entity { rows, columns }
}

/// Handle to an entity in the intermediate results.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

/// Disjoint groups of the relations touched so far.
///
/// A relation maps directly to the entity holding it. Merged entities are
/// removed and their relations re-pointed to the merge result.
#[derive(Debug, Default)]
pub struct IntermediateResults {
    slots: Vec<Option<Entity>>,
    owner: HashMap<RelationId, EntityId>,
}

impl IntermediateResults {
    pub fn find(&self, relation: RelationId) -> Option<EntityId> {
        self.owner.get(&relation).copied()
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Live entities in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (EntityId(i), e)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_empty()
    }

    fn insert(&mut self, entity: Entity) -> EntityId {
        let id = EntityId(self.slots.len());
        for relation in entity.relations() {
            let previous = self.owner.insert(relation, id);
            debug_assert!(previous.is_none(), "relation {relation} tracked twice");
        }
        self.slots.push(Some(entity));
        id
    }

    fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.slots.get_mut(id.0)?.take()?;
        for relation in entity.relations() {
            self.owner.remove(&relation);
        }
        Some(entity)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.owner.clear();
    }
}

/// How a join predicate relates to the current intermediate results.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum JoinShape {
    /// Both operands read the same relation, not tracked yet.
    ExternalSelf,
    /// Both operands are tracked by the same entity.
    InternalSelf(EntityId),
    /// Neither relation is tracked yet.
    External,
    /// One side is tracked by `entity`, the other is pulled in fresh.
    SemiInternal { entity: EntityId, tracked_is_lhs: bool },
    /// Both sides are tracked, by two different entities.
    Internal { lhs: EntityId, rhs: EntityId },
}

pub struct Executioner<'r> {
    relations: &'r [Relation],
    config: JoinConfig,
    store: IntermediateResults,
}

impl<'r> Executioner<'r> {
    /// An executioner over `relations`, addressed by their position.
    pub fn new(relations: &'r [Relation]) -> Self {
        Self {
            relations,
            config: JoinConfig::new(),
            store: IntermediateResults::default(),
        }
    }

    pub fn with_config(mut self, config: JoinConfig) -> Self {
        self.config = config;
        self
    }

    /// Intermediate results left by the last `execute`.
    pub fn store(&self) -> &IntermediateResults {
        &self.store
    }

    /// Runs every predicate of `query` in order and returns one decimal sum
    /// per checksum request.
    pub fn execute(&mut self, query: &Query) -> Result<Vec<String>> {
        let _span = debug_span!(
            "execute",
            predicates = query.predicates.len(),
            checksums = query.checksums.len(),
        )
        .entered();

        self.store.clear();
        for operand in query.operands() {
            self.relation(operand.relation)?;
        }

        for (i, predicate) in query.predicates.iter().enumerate() {
            let _span = debug_span!("predicate", index = i, cmp = ?predicate.cmp).entered();
            match predicate.rhs {
                Rhs::Constant(constant) => {
                    self.execute_filter(predicate.lhs, predicate.cmp, constant)?
                }
                Rhs::Operand(rhs) => self.execute_join(predicate.lhs, predicate.cmp, rhs)?,
            }
        }

        self.calculate_checksums(&query.checksums)
    }

    fn relation(&self, relation: RelationId) -> Result<&'r Relation> {
        self.relations.get(relation).ok_or(Error::UnknownRelation {
            relation,
            catalog: self.relations.len(),
        })
    }

    fn entity(&self, id: EntityId, relation: RelationId) -> Result<&Entity> {
        self.store.get(id).ok_or(Error::UntrackedRelation(relation))
    }

    fn execute_filter(&mut self, operand: Operand, cmp: Comparison, constant: u64) -> Result<()> {
        let relation = self.relation(operand.relation)?;

        match self.store.find(operand.relation) {
            Some(id) => {
                let entity = self
                    .store
                    .get_mut(id)
                    .ok_or(Error::UntrackedRelation(operand.relation))?;
                let keep: Vec<bool> = entity
                    .keys(operand.relation)?
                    .iter()
                    .map(|&key| cmp.holds(relation.value(key, operand.column), constant))
                    .collect();
                entity.retain_rows(&keep);
                debug!(
                    relation = operand.relation,
                    rows = entity.column_size(),
                    "filtered tracked relation"
                );
            }
            None => {
                let keys: Vec<u64> = relation
                    .tuples()
                    .iter()
                    .filter(|t| cmp.holds(operand.value(t), constant))
                    .map(|t| t.key)
                    .collect();
                debug!(relation = operand.relation, rows = keys.len(), "filtered relation");
                self.store.insert(Entity::single(operand.relation, keys));
            }
        }
        Ok(())
    }

    fn classify(&self, lhs: Operand, rhs: Operand) -> JoinShape {
        match (self.store.find(lhs.relation), self.store.find(rhs.relation)) {
            (None, None) if lhs.relation == rhs.relation => JoinShape::ExternalSelf,
            (None, None) => JoinShape::External,
            (Some(l), Some(r)) if l == r => JoinShape::InternalSelf(l),
            (Some(l), Some(r)) => JoinShape::Internal { lhs: l, rhs: r },
            (Some(entity), None) => JoinShape::SemiInternal {
                entity,
                tracked_is_lhs: true,
            },
            (None, Some(entity)) => JoinShape::SemiInternal {
                entity,
                tracked_is_lhs: false,
            },
        }
    }

    fn execute_join(&mut self, lhs: Operand, cmp: Comparison, rhs: Operand) -> Result<()> {
        let shape = self.classify(lhs, rhs);
        debug!(?shape, lhs = lhs.relation, rhs = rhs.relation, "join");

        match shape {
            JoinShape::ExternalSelf => self.external_self_join(lhs, cmp, rhs),
            JoinShape::InternalSelf(id) => self.internal_self_join(id, lhs, cmp, rhs),
            JoinShape::External => self.external_join(lhs, cmp, rhs),
            JoinShape::SemiInternal {
                entity,
                tracked_is_lhs: true,
            } => self.semi_internal_join(entity, lhs, cmp, rhs),
            JoinShape::SemiInternal {
                entity,
                tracked_is_lhs: false,
            } => self.semi_internal_join(entity, rhs, cmp.flip(), lhs),
            JoinShape::Internal { lhs: l, rhs: r } => self.internal_join(l, lhs, cmp, r, rhs),
        }
    }

    /// Hash join for equality, pairwise comparison otherwise. Pairs are
    /// `(left key, right key)`.
    fn join_tuples(&self, left: &[Tuple], cmp: Comparison, right: &[Tuple]) -> Result<ResultList> {
        match cmp {
            Comparison::Equal => radix_join(left, right, &self.config),
            _ => nested_loop_join(left, right, cmp),
        }
    }

    /// Compares two columns of one untracked relation, tuple by tuple.
    fn external_self_join(&mut self, lhs: Operand, cmp: Comparison, rhs: Operand) -> Result<()> {
        let relation = self.relation(lhs.relation)?;
        let keys: Vec<u64> = relation
            .tuples()
            .iter()
            .filter(|t| cmp.holds(lhs.value(t), rhs.value(t)))
            .map(|t| t.key)
            .collect();
        debug!(relation = lhs.relation, rows = keys.len(), "external self join");
        self.store.insert(Entity::single(lhs.relation, keys));
        Ok(())
    }

    /// Compares two tracked columns of one entity, row by row.
    fn internal_self_join(
        &mut self,
        id: EntityId,
        lhs: Operand,
        cmp: Comparison,
        rhs: Operand,
    ) -> Result<()> {
        let lhs_relation = self.relation(lhs.relation)?;
        let rhs_relation = self.relation(rhs.relation)?;
        let entity = self
            .store
            .get_mut(id)
            .ok_or(Error::UntrackedRelation(lhs.relation))?;

        let keep: Vec<bool> = entity
            .keys(lhs.relation)?
            .iter()
            .zip(entity.keys(rhs.relation)?)
            .map(|(&l, &r)| {
                cmp.holds(
                    lhs_relation.value(l, lhs.column),
                    rhs_relation.value(r, rhs.column),
                )
            })
            .collect();
        entity.retain_rows(&keep);
        debug!(rows = entity.column_size(), "internal self join");
        Ok(())
    }

    /// Joins two untracked relations into a new two-column entity.
    fn external_join(&mut self, lhs: Operand, cmp: Comparison, rhs: Operand) -> Result<()> {
        let left = self.relation(lhs.relation)?.project(lhs.column);
        let right = self.relation(rhs.relation)?.project(rhs.column);
        let pairs = self.join_tuples(&left, cmp, &right)?;

        let entity = Entity {
            rows: pairs.len(),
            columns: BTreeMap::from([
                (lhs.relation, pairs.iter().map(|p| p.key1).collect()),
                (rhs.relation, pairs.iter().map(|p| p.key2).collect()),
            ]),
        };
        debug!(rows = entity.column_size(), "external join");
        self.store.insert(entity);
        Ok(())
    }

    /// Extends the entity tracking `tracked` with the untracked `fresh`
    /// relation. `cmp` reads `tracked OP fresh`.
    fn semi_internal_join(
        &mut self,
        id: EntityId,
        tracked: Operand,
        cmp: Comparison,
        fresh: Operand,
    ) -> Result<()> {
        let tracked_relation = self.relation(tracked.relation)?;
        let fresh_relation = self.relation(fresh.relation)?;

        let extended = {
            let entity = self.entity(id, tracked.relation)?;
            let left = entity.positional(tracked_relation, tracked)?;
            let right = fresh_relation.project(fresh.column);
            let pairs = self.join_tuples(&left, cmp, &right)?;

            let mut columns: BTreeMap<RelationId, Vec<u64>> = BTreeMap::new();
            for (&relation, keys) in &entity.columns {
                columns.insert(relation, pairs.iter().map(|p| keys[p.key1 as usize]).collect());
            }
            columns.insert(fresh.relation, pairs.iter().map(|p| p.key2).collect());
            Entity {
                rows: pairs.len(),
                columns,
            }
        };

        debug!(
            relation = fresh.relation,
            rows = extended.column_size(),
            "semi-internal join"
        );
        self.store.remove(id);
        self.store.insert(extended);
        Ok(())
    }

    /// Joins two entities on one column each and merges them.
    fn internal_join(
        &mut self,
        lhs_id: EntityId,
        lhs: Operand,
        cmp: Comparison,
        rhs_id: EntityId,
        rhs: Operand,
    ) -> Result<()> {
        let lhs_relation = self.relation(lhs.relation)?;
        let rhs_relation = self.relation(rhs.relation)?;

        let merged = {
            let left = self.entity(lhs_id, lhs.relation)?;
            let right = self.entity(rhs_id, rhs.relation)?;
            let pairs = self.join_tuples(
                &left.positional(lhs_relation, lhs)?,
                cmp,
                &right.positional(rhs_relation, rhs)?,
            )?;
            combine(
                left,
                right,
                pairs.iter().map(|p| p.key1 as usize),
                pairs.iter().map(|p| p.key2 as usize),
                pairs.len(),
            )
        };

        debug!(
            columns = merged.column_num(),
            rows = merged.column_size(),
            "internal join"
        );
        self.store.remove(lhs_id);
        self.store.remove(rhs_id);
        self.store.insert(merged);
        Ok(())
    }

    /// Merges two unconnected entities into one holding every combination of
    /// their rows, left-major. Both inputs are destroyed, so the same entity
    /// cannot appear on both sides.
    pub fn cartesian_product(&mut self, left: EntityId, right: EntityId) -> Result<EntityId> {
        if left == right {
            return Err(Error::StaleEntity(right.0));
        }
        let merged = {
            let l = self.store.get(left).ok_or(Error::StaleEntity(left.0))?;
            let r = self.store.get(right).ok_or(Error::StaleEntity(right.0))?;
            let (m, n) = (l.column_size(), r.column_size());
            combine(
                l,
                r,
                (0..m).flat_map(move |i| iter::repeat_n(i, n)),
                (0..m).flat_map(move |_| 0..n),
                m * n,
            )
        };

        debug!(
            columns = merged.column_num(),
            rows = merged.column_size(),
            "cartesian product"
        );
        self.store.remove(left);
        self.store.remove(right);
        Ok(self.store.insert(merged))
    }

    fn calculate_checksums(&mut self, checksums: &[Checksum]) -> Result<Vec<String>> {
        if checksums.is_empty() {
            return Ok(Vec::new());
        }

        // Relations only named by checksums join the result unfiltered.
        for checksum in checksums {
            if self.store.find(checksum.relation).is_none() {
                let relation = self.relation(checksum.relation)?;
                let keys = relation.tuples().iter().map(|t| t.key).collect();
                self.store.insert(Entity::single(checksum.relation, keys));
            }
        }

        // The result is the product of every disconnected group.
        let ids: Vec<EntityId> = self.store.iter().map(|(id, _)| id).collect();
        let Some((&first, rest)) = ids.split_first() else {
            return Err(Error::UntrackedRelation(checksums[0].relation));
        };
        let mut result = first;
        for &id in rest {
            result = self.cartesian_product(result, id)?;
        }

        // A checksum sums the surviving row keys of its relation; the column
        // role of the request does not change the sum.
        let entity = self.entity(result, checksums[0].relation)?;
        checksums
            .iter()
            .map(|checksum| {
                let sum = entity
                    .keys(checksum.relation)?
                    .iter()
                    .fold(0_u64, |acc, &key| acc.wrapping_add(key));
                Ok(sum.to_string())
            })
            .collect()
    }
}
