//! Typed ID definitions for pool resources.

use crate::define_id;

define_id!(PoolId, "pool");
define_id!(MachineId, "mach");
define_id!(WorkloadId, "wl");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pool_id_roundtrip() {
        let id = PoolId::new();
        let s = id.to_string();
        let parsed: PoolId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_generated_id_prefix_and_charset() {
        let id = MachineId::new();
        assert!(id.as_str().starts_with("mach"));
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!id.as_str().chars().any(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn test_host_assigned_id_accepted() {
        let id: PoolId = "env1".parse().unwrap();
        assert_eq!(id.as_str(), "env1");
        let id: MachineId = "M7".parse().unwrap();
        assert_eq!(id.to_string(), "M7");
    }

    #[test]
    fn test_id_empty() {
        let result: Result<PoolId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_id_invalid_character() {
        let result: Result<MachineId, _> = "m-7".parse();
        assert_eq!(
            result.unwrap_err(),
            crate::IdError::InvalidCharacter {
                position: 1,
                found: '-'
            }
        );
    }

    #[test]
    fn test_id_json_roundtrip() {
        let id = WorkloadId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: WorkloadId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_json_rejects_invalid() {
        let result: Result<PoolId, _> = serde_json::from_str("\"env:1\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_machine_id_sortable() {
        let id1 = MachineId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = MachineId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            PoolId::PREFIX,
            MachineId::PREFIX,
            WorkloadId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_alphanumeric_tokens_parse(s in "[A-Za-z0-9]{1,32}") {
            let id = PoolId::parse(&s).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }

        #[test]
        fn prop_tokens_with_separator_rejected(a in "[a-z0-9]{1,8}", b in "[a-z0-9]{1,8}") {
            let s = format!("{a}:{b}");
            prop_assert!(MachineId::parse(&s).is_err());
        }
    }
}
