//! Tests for TypedStorage
//!
//! These tests verify:
//! - Serde values survive a write/read cycle
//! - Conditional operations compare encoded values
//! - Prefix lookups and typed group members
//! - Decode failures surface as serialization errors

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sdlkv::{SdlError, SyncStorage, TypedStorage};

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CellState {
    id: u32,
    name: String,
    neighbours: Vec<u32>,
}

fn cell(id: u32) -> CellState {
    CellState {
        id,
        name: format!("cell-{}", id),
        neighbours: vec![id + 1, id + 2],
    }
}

// =============================================================================
// Value Tests
// =============================================================================

#[test]
fn test_struct_value() {
    let sdl = SyncStorage::in_memory();
    let typed = TypedStorage::new(&sdl);

    typed.set("ns", "cell", &cell(7)).unwrap();

    assert_eq!(typed.get::<CellState>("ns", "cell").unwrap(), Some(cell(7)));
    assert_eq!(typed.get::<CellState>("ns", "missing").unwrap(), None);
}

#[test]
fn test_typed_set_if_and_remove_if() {
    let sdl = SyncStorage::in_memory();
    let typed = TypedStorage::new(&sdl);
    typed.set("ns", "n", &1u64).unwrap();

    assert!(!typed.set_if("ns", "n", &5u64, &6u64).unwrap());
    assert!(typed.set_if("ns", "n", &1u64, &2u64).unwrap());
    assert!(!typed.set_if_not_exists("ns", "n", &9u64).unwrap());
    assert!(typed.remove_if("ns", "n", &2u64).unwrap());
    assert_eq!(typed.get::<u64>("ns", "n").unwrap(), None);
}

#[test]
fn test_find_and_get_by_prefix() {
    let sdl = SyncStorage::in_memory();
    let typed = TypedStorage::new(&sdl);
    typed.set("ns", "cell_1", &cell(1)).unwrap();
    typed.set("ns", "cell_2", &cell(2)).unwrap();
    typed.set("ns", "other", &cell(3)).unwrap();

    let found = typed.find_and_get::<CellState>("ns", "cell_").unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found["cell_2"], cell(2));
}

#[test]
fn test_typed_members() {
    let sdl = SyncStorage::in_memory();
    let typed = TypedStorage::new(&sdl);

    typed.add_member("ns", "ids", &10u32).unwrap();
    typed.add_member("ns", "ids", &20u32).unwrap();
    typed.remove_member("ns", "ids", &10u32).unwrap();

    assert!(typed.is_member("ns", "ids", &20u32).unwrap());
    assert!(!typed.is_member("ns", "ids", &10u32).unwrap());
    let members = typed.get_members::<u32>("ns", "ids").unwrap();
    assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![20]);
}

#[test]
fn test_undecodable_value_is_serialization_error() {
    let sdl = SyncStorage::in_memory();
    let typed = TypedStorage::new(&sdl);
    let mut raw = HashMap::new();
    raw.insert("k".to_string(), vec![1u8]);
    typed.raw().set("ns", &raw).unwrap();

    assert!(matches!(
        typed.get::<CellState>("ns", "k"),
        Err(SdlError::Serialization(_))
    ));
}
