//! Persistence layer tests

use neovolt::persistence::{DailyEnergyState, PersistenceManager};
use tempfile::TempDir;

#[test]
fn missing_file_yields_default_state() {
    let dir = TempDir::new().unwrap();
    let manager = PersistenceManager::new(dir.path(), "garage").unwrap();
    assert_eq!(manager.load(), DailyEnergyState::default());
}

#[test]
fn save_and_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let manager = PersistenceManager::new(dir.path(), "garage").unwrap();
    let state = DailyEnergyState {
        last_reset_date: Some("2026-08-23".to_string()),
        midnight_baseline_kwh: Some(1234.56),
        last_known_total_kwh: Some(1240.01),
        preserved_daily_kwh: Some(5.45),
    };
    manager.save(&state).unwrap();
    assert_eq!(manager.load(), state);
}

#[test]
fn corrupt_file_falls_back_to_default() {
    let dir = TempDir::new().unwrap();
    let manager = PersistenceManager::new(dir.path(), "garage").unwrap();
    std::fs::write(manager.file_path(), "{not json").unwrap();
    assert_eq!(manager.load(), DailyEnergyState::default());
}

#[test]
fn state_files_are_per_inverter() {
    let dir = TempDir::new().unwrap();
    let a = PersistenceManager::new(dir.path(), "garage").unwrap();
    let b = PersistenceManager::new(dir.path(), "shed").unwrap();
    assert_ne!(a.file_path(), b.file_path());

    a.save(&DailyEnergyState {
        preserved_daily_kwh: Some(3.0),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(b.load(), DailyEnergyState::default());
    assert_eq!(a.load().preserved_daily_kwh, Some(3.0));
}

#[test]
fn state_dir_is_created_on_demand() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("state").join("neovolt");
    let manager = PersistenceManager::new(&nested, "garage").unwrap();
    manager.save(&DailyEnergyState::default()).unwrap();
    assert!(nested.exists());
}
