#![allow(missing_docs)]

use shared::{PathSegment, PathSegmentError};

#[test]
fn valid_segment() {
    let segment = PathSegment::try_from("Northwind.Orders-A").unwrap();
    assert_eq!(segment.as_str(), "Northwind.Orders-A");
    assert_eq!(segment.to_string(), "Northwind.Orders-A");
}

#[test]
fn empty_segment() {
    assert_eq!(PathSegment::try_from(""), Err(PathSegmentError::Empty));
}

#[test]
fn separator_is_invalid() {
    assert_eq!(
        PathSegment::try_from("a/b"),
        Err(PathSegmentError::Invalid(1, '/'))
    );
    assert_eq!(
        PathSegment::try_from("a\\b"),
        Err(PathSegmentError::Invalid(1, '\\'))
    );
}

#[test]
fn relative_is_invalid() {
    assert_eq!(PathSegment::try_from(".."), Err(PathSegmentError::Relative));
}

#[test]
fn too_long() {
    let value = "a".repeat(PathSegment::MAX_LENGTH + 1);
    assert_eq!(
        PathSegment::try_from(value),
        Err(PathSegmentError::TooLong(
            PathSegment::MAX_LENGTH + 1,
            PathSegment::MAX_LENGTH
        ))
    );
}

#[test]
fn deserialize_rejects_invalid() {
    let result: Result<PathSegment, _> = serde_json::from_str("\"a:b\"");
    assert!(result.is_err());

    let segment: PathSegment = serde_json::from_str("\"orders\"").unwrap();
    assert_eq!(serde_json::to_string(&segment).unwrap(), "\"orders\"");
}
