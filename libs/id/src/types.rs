//! Typed ID definitions.

use crate::define_id;

define_id!(BootId, "boot");
define_id!(RecordId, "rec");
define_id!(ErrorEventId, "err");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_id_prefix() {
        let id = BootId::new();
        assert!(id.to_string().starts_with("boot_"));
    }

    #[test]
    fn test_record_id_rejects_boot_prefix() {
        let boot = BootId::new().to_string();
        let result: Result<RecordId, _> = boot.parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::WrongPrefix { expected: "rec", .. }
        ));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<RecordId, _> = "rec01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Malformed(_)));
    }

    #[test]
    fn test_empty_and_invalid_ulid() {
        assert!(matches!(
            "".parse::<BootId>().unwrap_err(),
            crate::IdError::Malformed(_)
        ));
        assert!(matches!(
            "boot_nope".parse::<BootId>().unwrap_err(),
            crate::IdError::InvalidUlid { .. }
        ));
    }

    #[test]
    fn test_record_id_serializes_as_prefixed_string() {
        let id = RecordId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"rec_"));
        let parsed: RecordId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_short_form_is_ulid_suffix() {
        let id = BootId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().ends_with(&id.short()));
    }

    #[test]
    fn test_boot_ids_sort_by_creation() {
        let first = BootId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = BootId::new();
        assert!(first < second);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [BootId::PREFIX, RecordId::PREFIX, ErrorEventId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }
}
