use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use sluice_cql::frame::response::error::DbError;

use crate::frame::{RequestFrame, RequestOpcode, ResponseFrame};

/// Specifies when an associated [`RequestReaction`] will be performed.
/// Conditions are subject to logic, with `not()`, `and()` and `or()`
/// convenience functions.
#[derive(Debug, Clone)]
pub enum Condition {
    True,

    False,

    Not(Box<Condition>),

    And(Box<Condition>, Box<Condition>),

    Or(Box<Condition>, Box<Condition>),

    /// True iff the frame has come in the n-th connection the driver established with the node.
    ConnectionSeqNo(usize),

    /// True iff the request has the given opcode.
    RequestOpcode(RequestOpcode),

    /// True iff the frame body contains the given byte slice, with case-sensitive comparison.
    BodyContainsCaseSensitive(Box<[u8]>),

    /// True iff the frame body contains the given byte slice, with case-insensitive comparison (ASCII only).
    BodyContainsCaseInsensitive(Box<[u8]>),
}

/// The context in which [`Conditions`](Condition) are evaluated.
pub(crate) struct EvaluationContext {
    pub(crate) connection_seq_no: usize,
    pub(crate) opcode: RequestOpcode,
    pub(crate) frame_body: Bytes,
}

impl Condition {
    pub(crate) fn eval(&self, ctx: &EvaluationContext) -> bool {
        match self {
            Condition::True => true,

            Condition::False => false,

            Condition::Not(c) => !c.eval(ctx),

            Condition::And(c1, c2) => c1.eval(ctx) && c2.eval(ctx),

            Condition::Or(c1, c2) => c1.eval(ctx) || c2.eval(ctx),

            Condition::ConnectionSeqNo(no) => *no == ctx.connection_seq_no,

            Condition::RequestOpcode(op) => *op == ctx.opcode,

            Condition::BodyContainsCaseSensitive(pattern) => ctx
                .frame_body
                .windows(pattern.len())
                .any(|window| *window == **pattern),

            Condition::BodyContainsCaseInsensitive(pattern) => ctx
                .frame_body
                .windows(pattern.len())
                .any(|window| window.eq_ignore_ascii_case(pattern)),
        }
    }

    /// A convenience function for creating [Condition::Not] variant.
    #[allow(clippy::should_implement_trait)]
    pub fn not(c: Self) -> Self {
        Condition::Not(Box::new(c))
    }

    /// A convenience function for creating [Condition::And] variant.
    pub fn and(self, c2: Self) -> Self {
        Self::And(Box::new(self), Box::new(c2))
    }

    /// A convenience function for creating [Condition::Or] variant.
    pub fn or(self, c2: Self) -> Self {
        Self::Or(Box::new(self), Box::new(c2))
    }
}

/// Describes what to do with a request frame, how to transform it and after what delay.
#[derive(Clone)]
pub struct Action<TFrom, TTo> {
    pub delay: Option<Duration>,
    pub msg_processor: Option<Arc<dyn Fn(TFrom) -> TTo + Send + Sync>>,
}

/// What the mock does with a request matched by a [`RequestRule`].
///
/// `to_node` hands the frame to the node, which answers it as usual; leaving it
/// out drops the frame. `to_sender` answers the driver directly.
#[derive(Clone)]
pub struct RequestReaction {
    pub to_node: Option<Action<RequestFrame, RequestFrame>>,
    pub to_sender: Option<Action<RequestFrame, ResponseFrame>>,
    pub drop_connection: Option<Option<Duration>>,
}

impl RequestReaction {
    /// Lets the node answer the frame.
    pub fn noop() -> Self {
        Self {
            to_node: Some(Action {
                delay: None,
                msg_processor: None,
            }),
            to_sender: None,
            drop_connection: None,
        }
    }

    /// Leaves the frame unanswered.
    pub fn drop_frame() -> Self {
        Self {
            to_node: None,
            to_sender: None,
            drop_connection: None,
        }
    }

    /// Lets the node answer the frame after `delay`.
    pub fn delay(delay: Duration) -> Self {
        Self {
            to_node: Some(Action {
                delay: Some(delay),
                msg_processor: None,
            }),
            to_sender: None,
            drop_connection: None,
        }
    }

    /// Answers the frame with whatever `forge` makes of it.
    pub fn forge_response(forge: Arc<dyn Fn(RequestFrame) -> ResponseFrame + Send + Sync>) -> Self {
        Self {
            to_node: None,
            to_sender: Some(Action {
                delay: None,
                msg_processor: Some(forge),
            }),
            drop_connection: None,
        }
    }

    /// Answers the frame with `error`.
    pub fn forge_with_error(error: DbError) -> Self {
        Self::forge_response(Arc::new(move |frame: RequestFrame| {
            ResponseFrame::forged_error(frame.params, error.clone(), None)
                .expect("error response fits in a frame")
        }))
    }

    /// Closes the connection without answering.
    pub fn drop_connection() -> Self {
        Self {
            to_node: None,
            to_sender: None,
            drop_connection: Some(None),
        }
    }

    /// Closes the connection `delay` after the frame arrived, without answering.
    pub fn drop_connection_after(delay: Duration) -> Self {
        Self {
            to_node: None,
            to_sender: None,
            drop_connection: Some(Some(delay)),
        }
    }

    /// Delays whatever the reaction does with the frame.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if let Some(action) = &mut self.to_node {
            action.delay = Some(delay);
        }
        if let Some(action) = &mut self.to_sender {
            action.delay = Some(delay);
        }
        self
    }
}

/// A rule describing what the mock does with a received request frame
/// and on what conditions. The first rule whose condition holds applies.
#[derive(Clone)]
pub struct RequestRule(pub Condition, pub RequestReaction);
