// # Driver Code Tables
//
// Coarse routing: which backend error codes count as transient (safe to
// retry) versus fatal. Codes are preserved verbatim on errors; this table
// only decides retry eligibility. The set is deliberately explicit and
// documented here rather than discovered empirically at runtime; adapter
// crates for real drivers extend it through `is_retryable_code`.

/// Exact transient codes across the supported backends.
///
/// Relational (SQLSTATE): 08000/08003/08006 connection exceptions, 40001
/// serialization failure, 40P01 postgres deadlock, 57P03 cannot-connect-now.
/// MySQL numeric: 1205 lock wait timeout, 1213 deadlock, 2006/2013 server
/// gone/lost connection. Redis: TRYAGAIN, LOADING, CLUSTERDOWN, BUSY.
/// Cassandra: unavailable, overloaded, write_timeout, read_timeout.
/// Dynamo: ProvisionedThroughputExceededException, ThrottlingException,
/// RequestLimitExceeded. Socket-level: ECONNRESET, ECONNREFUSED, ETIMEDOUT,
/// EPIPE.
const TRANSIENT_CODES: &[&str] = &[
    "08000",
    "08003",
    "08006",
    "40001",
    "40P01",
    "57P03",
    "1205",
    "1213",
    "2006",
    "2013",
    "TRYAGAIN",
    "LOADING",
    "CLUSTERDOWN",
    "BUSY",
    "unavailable",
    "overloaded",
    "write_timeout",
    "read_timeout",
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "EPIPE",
];

/// Prefix rules for namespaced codes (neo4j transient class).
const TRANSIENT_PREFIXES: &[&str] = &["Neo.TransientError."];

/// Whether a driver code is safe to retry.
pub fn is_retryable_code(code: &str) -> bool {
    TRANSIENT_CODES.contains(&code)
        || TRANSIENT_PREFIXES
            .iter()
            .any(|prefix| code.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlocks_and_disconnects_are_transient() {
        assert!(is_retryable_code("40P01"));
        assert!(is_retryable_code("1213"));
        assert!(is_retryable_code("08006"));
        assert!(is_retryable_code("ECONNRESET"));
        assert!(is_retryable_code("Neo.TransientError.Transaction.DeadlockDetected"));
    }

    #[test]
    fn logic_errors_are_fatal() {
        assert!(!is_retryable_code("42601")); // syntax error
        assert!(!is_retryable_code("23505")); // unique violation
        assert!(!is_retryable_code("28P01")); // bad password
        assert!(!is_retryable_code("Neo.ClientError.Statement.SyntaxError"));
    }
}
