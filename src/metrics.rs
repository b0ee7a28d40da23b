use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    static ref OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "tfstate_operations_total",
        "Backend operations by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("can register tfstate_operations_total");
    static ref BYTES_RECEIVED: IntCounter = register_int_counter!(
        "tfstate_bytes_received_total",
        "State bytes written by clients"
    )
    .expect("can register tfstate_bytes_received_total");
    static ref BYTES_SENT: IntCounter = register_int_counter!(
        "tfstate_bytes_sent_total",
        "State bytes read by clients"
    )
    .expect("can register tfstate_bytes_sent_total");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    ReadState,
    WriteState,
    DeleteState,
    AcquireLock,
    ReleaseLock,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::ReadState => "read_state",
            Operation::WriteState => "write_state",
            Operation::DeleteState => "delete_state",
            Operation::AcquireLock => "acquire_lock",
            Operation::ReleaseLock => "release_lock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    NotFound,
    Conflict,
    Unauthorized,
    Malformed,
    StorageError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::NotFound => "not_found",
            Outcome::Conflict => "conflict",
            Outcome::Unauthorized => "unauthorized",
            Outcome::Malformed => "malformed",
            Outcome::StorageError => "storage_error",
        }
    }
}

/// Handle to the process-wide counters in the default prometheus registry.
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics;

impl SharedMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn operation(&self, op: Operation, outcome: Outcome) {
        OPERATIONS
            .with_label_values(&[op.as_str(), outcome.as_str()])
            .inc();
    }

    pub fn bytes_received(&self, amount: usize) {
        BYTES_RECEIVED.inc_by(amount as u64);
    }

    pub fn bytes_sent(&self, amount: usize) {
        BYTES_SENT.inc_by(amount as u64);
    }

    /// Current value of an operation counter.
    #[cfg(test)]
    pub(crate) fn operation_count(&self, op: Operation, outcome: Outcome) -> u64 {
        OPERATIONS
            .with_label_values(&[op.as_str(), outcome.as_str()])
            .get()
    }
}
