/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Returns true if `uid` is a syntactically valid DICOM UID: at most 64 characters,
/// dot-separated numeric components without leading zeros.
/// UIDs end up as path components, so anything else must be refused before it touches a filesystem.
pub fn is_valid_uid(uid: &str) -> bool {
	if uid.is_empty() || uid.len() > 64 {
		return false;
	}
	uid.split('.').all(|component| {
		!component.is_empty()
			&& component.bytes().all(|b| b.is_ascii_digit())
			&& (component == "0" || !component.starts_with('0'))
	})
}

/// Trims the trailing padding that DICOM allows on UI values.
pub fn trim_uid(uid: &str) -> &str {
	uid.trim_end_matches(['\0', ' '])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_well_formed_uids() {
		assert!(is_valid_uid("1.2.840.10008.1.2.1"));
		assert!(is_valid_uid("2.25.0"));
	}

	#[test]
	fn rejects_malformed_uids() {
		assert!(!is_valid_uid(""));
		assert!(!is_valid_uid("1..2"));
		assert!(!is_valid_uid("1.02"));
		assert!(!is_valid_uid("../../etc"));
		assert!(!is_valid_uid(&"1".repeat(65)));
	}

	#[test]
	fn trims_padding() {
		assert_eq!(trim_uid("1.2.3\0"), "1.2.3");
		assert_eq!(trim_uid("1.2.3 "), "1.2.3");
	}
}
