//! Suspension-capable expression evaluation.
//!
//! Task expressions can depend on values that are not synchronously
//! available (another unit's coordinate on a replica that has not cached
//! it yet). Evaluation is therefore poll-based: [`poll`] either yields a
//! [`Value`], reports a typing failure, or suspends with
//! [`EvalPoll::Pending`] to be polled again next tick. Polling re-reads
//! its inputs from scratch - expressions are pure reads, so resumption
//! and re-evaluation are indistinguishable.

use serde::{Deserialize, Serialize};

use crate::coord::Coordinate;
use crate::task::{ScopeId, ScopeMemory, TaskId};
use crate::world::VoxelId;

/// A value flowing between tasks and expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A world coordinate.
    Coord(Coordinate),
    /// A voxel reference.
    Unit(VoxelId),
}

impl Value {
    /// The boolean payload, if this is a boolean.
    #[must_use]
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer.
    #[must_use]
    pub const fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            _ => None,
        }
    }
}

/// Comparison operators for [`Expr::Cmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// Equality. Defined for every value kind.
    Eq,
    /// Inequality. Defined for every value kind.
    Ne,
    /// Less-than. Integers only.
    Lt,
    /// Less-or-equal. Integers only.
    Le,
    /// Greater-than. Integers only.
    Gt,
    /// Greater-or-equal. Integers only.
    Ge,
}

/// An expression tree evaluated by the task engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    /// A literal.
    Const(Value),
    /// Read a published task output slot.
    Output {
        /// The owning scope.
        scope: ScopeId,
        /// The publishing node.
        node: TaskId,
        /// Slot index within the node's output buffer.
        slot: u8,
    },
    /// A unit's current coordinate. May suspend; yields `Unit` gone as an
    /// evaluation failure.
    UnitCoord(VoxelId),
    /// A unit's current health. May suspend.
    UnitHealth(VoxelId),
    /// Whether a unit still exists. May suspend.
    UnitExists(VoxelId),
    /// Boolean negation.
    Not(Box<Expr>),
    /// Short-circuit conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Binary comparison.
    Cmp {
        /// The operator.
        op: CmpOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Convenience literal.
    #[must_use]
    pub const fn bool(value: bool) -> Self {
        Self::Const(Value::Bool(value))
    }

    /// Convenience literal.
    #[must_use]
    pub const fn int(value: i64) -> Self {
        Self::Const(Value::Int(value))
    }

    /// Convenience comparison.
    #[must_use]
    pub fn cmp(op: CmpOp, lhs: Self, rhs: Self) -> Self {
        Self::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

/// Why an evaluation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalError {
    /// Operand kinds did not match the operator.
    TypeMismatch,
    /// An output slot was read before it was published.
    MissingOutput,
    /// A queried unit no longer exists.
    UnitGone,
}

/// Result of polling an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPoll {
    /// Evaluation finished with a value.
    Ready(Value),
    /// Evaluation finished with an error; the owning task fails.
    Failed(EvalError),
    /// A dependency is not available yet; poll again next tick.
    Pending,
}

/// An asynchronously fetched world fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch<T> {
    /// The fact is available now.
    Ready(T),
    /// The fact is being fetched; ask again next tick.
    Pending,
}

/// World facts an expression may depend on.
///
/// `Ready(None)` means the unit is definitively gone, which is an
/// evaluation failure; `Pending` suspends the evaluation.
pub trait QueryContext {
    /// A unit's current coordinate.
    fn unit_coord(&self, unit: VoxelId) -> Fetch<Option<Coordinate>>;
    /// A unit's current health.
    fn unit_health(&self, unit: VoxelId) -> Fetch<Option<u32>>;
}

/// Poll an expression against world facts and published task outputs.
pub fn poll<Q: QueryContext>(expr: &Expr, ctx: &Q, memory: &ScopeMemory) -> EvalPoll {
    match expr {
        Expr::Const(value) => EvalPoll::Ready(*value),
        Expr::Output { scope, node, slot } => match memory.read(*scope, *node, *slot) {
            Some(value) => EvalPoll::Ready(value),
            None => EvalPoll::Failed(EvalError::MissingOutput),
        },
        Expr::UnitCoord(unit) => match ctx.unit_coord(*unit) {
            Fetch::Ready(Some(coord)) => EvalPoll::Ready(Value::Coord(coord)),
            Fetch::Ready(None) => EvalPoll::Failed(EvalError::UnitGone),
            Fetch::Pending => EvalPoll::Pending,
        },
        Expr::UnitHealth(unit) => match ctx.unit_health(*unit) {
            Fetch::Ready(Some(health)) => EvalPoll::Ready(Value::Int(i64::from(health))),
            Fetch::Ready(None) => EvalPoll::Failed(EvalError::UnitGone),
            Fetch::Pending => EvalPoll::Pending,
        },
        Expr::UnitExists(unit) => match ctx.unit_health(*unit) {
            Fetch::Ready(existing) => EvalPoll::Ready(Value::Bool(existing.is_some())),
            Fetch::Pending => EvalPoll::Pending,
        },
        Expr::Not(inner) => match poll(inner, ctx, memory) {
            EvalPoll::Ready(value) => match value.as_bool() {
                Some(b) => EvalPoll::Ready(Value::Bool(!b)),
                None => EvalPoll::Failed(EvalError::TypeMismatch),
            },
            other => other,
        },
        Expr::And(lhs, rhs) => poll_logic(lhs, rhs, ctx, memory, false),
        Expr::Or(lhs, rhs) => poll_logic(lhs, rhs, ctx, memory, true),
        Expr::Cmp { op, lhs, rhs } => {
            let lhs = match poll(lhs, ctx, memory) {
                EvalPoll::Ready(value) => value,
                other => return other,
            };
            let rhs = match poll(rhs, ctx, memory) {
                EvalPoll::Ready(value) => value,
                other => return other,
            };
            compare(*op, lhs, rhs)
        }
    }
}

/// Short-circuit evaluation for `And`/`Or`. `short_on` is the left-hand
/// value that decides the result without looking right.
fn poll_logic<Q: QueryContext>(
    lhs: &Expr,
    rhs: &Expr,
    ctx: &Q,
    memory: &ScopeMemory,
    short_on: bool,
) -> EvalPoll {
    let left = match poll(lhs, ctx, memory) {
        EvalPoll::Ready(value) => match value.as_bool() {
            Some(b) => b,
            None => return EvalPoll::Failed(EvalError::TypeMismatch),
        },
        other => return other,
    };
    if left == short_on {
        return EvalPoll::Ready(Value::Bool(short_on));
    }
    match poll(rhs, ctx, memory) {
        EvalPoll::Ready(value) => match value.as_bool() {
            Some(b) => EvalPoll::Ready(Value::Bool(b)),
            None => EvalPoll::Failed(EvalError::TypeMismatch),
        },
        other => other,
    }
}

fn compare(op: CmpOp, lhs: Value, rhs: Value) -> EvalPoll {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (lhs, rhs) {
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Int(a), Value::Int(b)) => a == b,
                (Value::Coord(a), Value::Coord(b)) => a.same_cell(b),
                (Value::Unit(a), Value::Unit(b)) => a == b,
                _ => return EvalPoll::Failed(EvalError::TypeMismatch),
            };
            EvalPoll::Ready(Value::Bool(if op == CmpOp::Eq { equal } else { !equal }))
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) else {
                return EvalPoll::Failed(EvalError::TypeMismatch);
            };
            let result = match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            };
            EvalPoll::Ready(Value::Bool(result))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A context whose facts become available after a settable number of
    /// polls, for exercising suspension.
    struct DelayedContext {
        health: std::cell::Cell<u32>,
        delay: std::cell::Cell<u32>,
    }

    impl DelayedContext {
        fn ready(health: u32) -> Self {
            Self {
                health: std::cell::Cell::new(health),
                delay: std::cell::Cell::new(0),
            }
        }

        fn delayed(health: u32, polls: u32) -> Self {
            Self {
                health: std::cell::Cell::new(health),
                delay: std::cell::Cell::new(polls),
            }
        }
    }

    impl QueryContext for DelayedContext {
        fn unit_coord(&self, _unit: VoxelId) -> Fetch<Option<Coordinate>> {
            Fetch::Ready(Some(Coordinate::new(1, 2, 0, 0)))
        }

        fn unit_health(&self, _unit: VoxelId) -> Fetch<Option<u32>> {
            if self.delay.get() > 0 {
                self.delay.set(self.delay.get() - 1);
                Fetch::Pending
            } else {
                Fetch::Ready(Some(self.health.get()))
            }
        }
    }

    fn empty_memory() -> ScopeMemory {
        ScopeMemory::default()
    }

    #[test]
    fn test_constant_and_logic() {
        let ctx = DelayedContext::ready(0);
        let memory = empty_memory();
        let expr = Expr::And(
            Box::new(Expr::bool(true)),
            Box::new(Expr::Not(Box::new(Expr::bool(false)))),
        );
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Ready(Value::Bool(true)));
    }

    #[test]
    fn test_short_circuit_skips_pending_rhs() {
        // Or short-circuits on a true left side even though the right
        // side would suspend.
        let ctx = DelayedContext::delayed(10, 100);
        let memory = empty_memory();
        let expr = Expr::Or(
            Box::new(Expr::bool(true)),
            Box::new(Expr::cmp(CmpOp::Gt, Expr::UnitHealth(1), Expr::int(5))),
        );
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Ready(Value::Bool(true)));
    }

    #[test]
    fn test_pending_fact_suspends_then_resolves() {
        let ctx = DelayedContext::delayed(42, 2);
        let memory = empty_memory();
        let expr = Expr::cmp(CmpOp::Ge, Expr::UnitHealth(1), Expr::int(40));
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Pending);
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Pending);
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Ready(Value::Bool(true)));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let ctx = DelayedContext::ready(0);
        let memory = empty_memory();
        let expr = Expr::Not(Box::new(Expr::int(3)));
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Failed(EvalError::TypeMismatch));
        let expr = Expr::cmp(CmpOp::Lt, Expr::bool(true), Expr::int(1));
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Failed(EvalError::TypeMismatch));
    }

    #[test]
    fn test_coordinate_equality_is_scale_aware() {
        let ctx = DelayedContext::ready(0);
        let memory = empty_memory();
        // (2, 4) at weight 0 lies inside (1, 2) at weight 1.
        let expr = Expr::cmp(
            CmpOp::Eq,
            Expr::Const(Value::Coord(Coordinate::new(2, 4, 0, 0))),
            Expr::Const(Value::Coord(Coordinate::new(1, 2, 0, 1))),
        );
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Ready(Value::Bool(true)));
    }

    #[test]
    fn test_missing_output_fails() {
        let ctx = DelayedContext::ready(0);
        let memory = empty_memory();
        let expr = Expr::Output {
            scope: ScopeId(1),
            node: TaskId(2),
            slot: 0,
        };
        assert_eq!(poll(&expr, &ctx, &memory), EvalPoll::Failed(EvalError::MissingOutput));
    }
}
