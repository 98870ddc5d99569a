use serde::{Deserialize, Serialize};

use crate::ids::ClaimId;

/// Body of a schedule queue message: one placement request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleMsg {
    pub pool_id: String,
    pub size: i64,
}

/// Body of a per-node queue message: one run directive.
///
/// `claim_id` binds the container to its claim so the executor can
/// refresh the right TTL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMsg {
    pub size: i64,
    pub claim_id: ClaimId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn schedule_msg_wire_format() {
        let msg = ScheduleMsg {
            pool_id: "workers".to_string(),
            size: 3,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"pool_id":"workers","size":3}"#);

        let back: ScheduleMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn run_msg_wire_format() {
        let claim_id = ClaimId::from_str("6f9c2e4a-0b1d-4c3e-8f5a-7d6e9b0c1a2b").unwrap();
        let msg = RunMsg { size: 3, claim_id };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"size":3,"claim_id":"6f9c2e4a-0b1d-4c3e-8f5a-7d6e9b0c1a2b"}"#
        );
    }

    #[test]
    fn run_msg_rejects_missing_claim_id() {
        let err = serde_json::from_str::<RunMsg>(r#"{"size":3}"#);
        assert!(err.is_err());
    }
}
