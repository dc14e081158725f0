/// Observable service events, published on a broadcast channel so upper
/// layers can watch the aggregator without coupling to its internals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregatorEvent {
    /// A bundle passed admission and was persisted.
    BundleAdded { public_key_shorts: Vec<String> },
    /// A submission is ready but the unconfirmed-action cap is exhausted.
    WaitingUnconfirmedSpace,
    /// An aggregate bundle was mined; its rows are being removed.
    SubmissionConfirmed { row_ids: Vec<u64>, block_number: u64 },
    /// A query group (table transaction) was entered.
    QueryGroupStarted,
    /// A query group ended; `committed` is false on rollback.
    QueryGroupFinished { committed: bool },
}
