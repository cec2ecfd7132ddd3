//! Tokens and the channels that carry them.
//!
//! A token is the immutable record a node publishes when it completes. Each
//! dependency edge is a [`token_channel`]: the producer holds the
//! [`TokenSender`], the consumer the [`TokenReceiver`]. A producer with
//! several consumers owns one sender per consumer and sends the same token
//! to each. Errors travel the same way, as `Err` messages.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::connection::QueryResult;
use crate::error::AqpError;
use crate::ola::PartialSnapshot;

/// A table created by a completed node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        TableRef {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Output of a completed node, tagged by the kind of node that made it.
#[derive(Debug, Clone)]
pub enum ExecutionToken {
    /// A materialized temporary table.
    Table(TableRef),
    /// Rows returned to the caller.
    Rows(Arc<QueryResult>),
    /// A partial aggregate from a leaf or combiner.
    Partial(Arc<PartialSnapshot>),
}

impl ExecutionToken {
    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            ExecutionToken::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_rows(&self) -> Option<&Arc<QueryResult>> {
        match self {
            ExecutionToken::Rows(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_partial(&self) -> Option<&Arc<PartialSnapshot>> {
        match self {
            ExecutionToken::Partial(p) => Some(p),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ExecutionToken::Table(_) => "table",
            ExecutionToken::Rows(_) => "rows",
            ExecutionToken::Partial(_) => "partial",
        }
    }
}

/// What travels on an edge: a token, or the error that replaced it.
pub type QueueItem = Result<ExecutionToken, AqpError>;

/// Create the two ends of one dependency edge.
pub fn token_channel() -> (TokenSender, TokenReceiver) {
    let (tx, rx) = unbounded();
    (TokenSender { tx }, TokenReceiver { rx })
}

/// Producer end of an edge. Cloned into the execution handle so an abort
/// can wake the consumer.
#[derive(Debug, Clone)]
pub struct TokenSender {
    tx: Sender<QueueItem>,
}

impl TokenSender {
    /// Publish an item. Returns `false` if the consumer is gone.
    pub fn send(&self, item: QueueItem) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Deliver `reason` as an error. Items sent earlier are still received
    /// first.
    pub fn close(&self, reason: AqpError) {
        let _ = self.tx.send(Err(reason));
    }
}

/// Consumer end of an edge. Items arrive in FIFO order.
#[derive(Debug)]
pub struct TokenReceiver {
    rx: Receiver<QueueItem>,
}

impl TokenReceiver {
    /// Block until an item is available.
    ///
    /// Every sender dropping without a message is reported as an internal
    /// error: a node always publishes a token or an error before exiting.
    pub fn recv(&self) -> QueueItem {
        self.rx.recv().unwrap_or_else(|_| {
            Err(AqpError::InternalError(
                "token producer exited without publishing".into(),
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
