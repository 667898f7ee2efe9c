//! Parsed query model: operands, predicates and checksum requests.

use crate::relation::{Column, RelationId, Tuple};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    #[inline(always)]
    pub fn holds(self, lhs: u64, rhs: u64) -> bool {
        match self {
            Comparison::Equal => lhs == rhs,
            Comparison::NotEqual => lhs != rhs,
            Comparison::Less => lhs < rhs,
            Comparison::LessOrEqual => lhs <= rhs,
            Comparison::Greater => lhs > rhs,
            Comparison::GreaterOrEqual => lhs >= rhs,
        }
    }

    /// The comparison that holds for `(rhs, lhs)` exactly when this one holds
    /// for `(lhs, rhs)`.
    pub fn flip(self) -> Self {
        match self {
            Comparison::Less => Comparison::Greater,
            Comparison::LessOrEqual => Comparison::GreaterOrEqual,
            Comparison::Greater => Comparison::Less,
            Comparison::GreaterOrEqual => Comparison::LessOrEqual,
            symmetric => symmetric,
        }
    }
}

/// A column of one relation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Operand {
    pub relation: RelationId,
    pub column: Column,
}

impl Operand {
    pub fn key(relation: RelationId) -> Self {
        Self {
            relation,
            column: Column::Key,
        }
    }

    pub fn payload(relation: RelationId) -> Self {
        Self {
            relation,
            column: Column::Payload,
        }
    }

    #[inline(always)]
    pub fn value(&self, tuple: &Tuple) -> u64 {
        tuple.value(self.column)
    }
}

/// Right-hand side of a predicate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rhs {
    Operand(Operand),
    Constant(u64),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Predicate {
    pub lhs: Operand,
    pub rhs: Rhs,
    pub cmp: Comparison,
}

impl Predicate {
    pub fn filter(lhs: Operand, cmp: Comparison, constant: u64) -> Self {
        Self {
            lhs,
            rhs: Rhs::Constant(constant),
            cmp,
        }
    }

    pub fn join(lhs: Operand, cmp: Comparison, rhs: Operand) -> Self {
        Self {
            lhs,
            rhs: Rhs::Operand(rhs),
            cmp,
        }
    }

    /// Every operand this predicate reads.
    pub fn operands(&self) -> impl Iterator<Item = Operand> {
        let rhs = match self.rhs {
            Rhs::Operand(op) => Some(op),
            Rhs::Constant(_) => None,
        };
        std::iter::once(self.lhs).chain(rhs)
    }
}

/// Checksum requests name the relation whose surviving row keys are summed.
pub type Checksum = Operand;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub predicates: Vec<Predicate>,
    pub checksums: Vec<Checksum>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, lhs: Operand, cmp: Comparison, constant: u64) -> Self {
        self.predicates.push(Predicate::filter(lhs, cmp, constant));
        self
    }

    pub fn join(mut self, lhs: Operand, cmp: Comparison, rhs: Operand) -> Self {
        self.predicates.push(Predicate::join(lhs, cmp, rhs));
        self
    }

    pub fn checksum(mut self, operand: Operand) -> Self {
        self.checksums.push(operand);
        self
    }

    /// Operands of every predicate and checksum, in query order.
    pub fn operands(&self) -> impl Iterator<Item = Operand> + '_ {
        self.predicates
            .iter()
            .flat_map(Predicate::operands)
            .chain(self.checksums.iter().copied())
    }
}
