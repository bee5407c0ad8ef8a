//! Semantic client order IDs.
//!
//! Every order the engine places carries a client ID of the form
//! `CR_<ROLE>_<uuid12>`. The role prefix lets a restarted process recognize
//! its own exit legs on the venue and re-attach them to a supervisor.

use crate::core::OrderKind;
use uuid::Uuid;

const ID_PREFIX: &str = "CR";

fn role_tag(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Entry => "ENTRY",
        OrderKind::TakeProfit => "TP",
        OrderKind::StopLoss => "SL",
        OrderKind::ManualClose => "CLOSE",
    }
}

/// Mint a fresh client order ID for the given role
pub fn new_client_id(kind: OrderKind) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", ID_PREFIX, role_tag(kind), &uuid[..12])
}

/// Recover the role from a client ID minted by this engine, if it is one
pub fn parse_client_id(client_id: &str) -> Option<OrderKind> {
    let rest = client_id.strip_prefix("CR_")?;
    let (tag, _) = rest.split_once('_')?;
    match tag {
        "ENTRY" => Some(OrderKind::Entry),
        "TP" => Some(OrderKind::TakeProfit),
        "SL" => Some(OrderKind::StopLoss),
        "CLOSE" => Some(OrderKind::ManualClose),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_roles() {
        for kind in [
            OrderKind::Entry,
            OrderKind::TakeProfit,
            OrderKind::StopLoss,
            OrderKind::ManualClose,
        ] {
            let id = new_client_id(kind);
            assert_eq!(parse_client_id(&id), Some(kind));
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let a = new_client_id(OrderKind::Entry);
        let b = new_client_id(OrderKind::Entry);
        assert_ne!(a, b);
    }

    #[test]
    fn test_foreign_ids_rejected() {
        assert_eq!(parse_client_id("web_1234"), None);
        assert_eq!(parse_client_id("CR_BOGUS_abc"), None);
        assert_eq!(parse_client_id(""), None);
    }
}
