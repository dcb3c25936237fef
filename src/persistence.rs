// =============================================================================
// Persistence — atomic account state store and the emergency-stop flag file
// =============================================================================
//
// Two artifacts per account under the data directory:
//
//   {NNN}_bot_state.json   — grid state for every symbol, rewritten atomically
//                            (tmp + fsync + rename) on each committed mutation.
//   .{NNN}_emergency_stop  — hidden JSON flag. Its *presence* bars startup
//                            until an operator inspects the diagnostic and
//                            removes it; it survives corrupt state files.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Persisted schema
// ---------------------------------------------------------------------------

/// One filled opening order contributing to a side of the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridEntry {
    /// 0 = initial entry; strictly sequential per side.
    pub grid_level: u32,
    /// Base-asset quantity, always positive.
    pub qty_coins: f64,
    pub entry_price: f64,
    /// Cleared to `None` when verification finds the id absent on exchange.
    pub order_id: Option<String>,
    /// RFC-3339.
    pub opened_at: String,
}

/// Snapshot of one symbol's grid state as written to disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolStateSnapshot {
    #[serde(default)]
    pub long: Vec<GridEntry>,
    #[serde(default)]
    pub short: Vec<GridEntry>,
    #[serde(default)]
    pub tp_long: Option<String>,
    #[serde(default)]
    pub tp_short: Option<String>,
    #[serde(default)]
    pub reference_qty_per_level: BTreeMap<u32, f64>,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BotStateFile {
    symbols: BTreeMap<String, SymbolStateSnapshot>,
}

// ---------------------------------------------------------------------------
// State store
// ---------------------------------------------------------------------------

/// Account-wide state file with atomic writes.
///
/// Each ledger persists through this store while holding its own lock, so a
/// snapshot on disk always reflects a single committed mutation.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<BotStateFile>,
}

impl StateStore {
    /// Open (or create) the state store for an account. An existing file is
    /// loaded so ledgers can restore from it.
    pub fn open(data_dir: impl AsRef<Path>, account_tag: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let path = data_dir.join(format!("{account_tag}_bot_state.json"));
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read state from {}", path.display()))?;
            let file: BotStateFile = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse state from {}", path.display()))?;
            info!(
                path = %path.display(),
                symbols = file.symbols.len(),
                "persisted state loaded"
            );
            file
        } else {
            BotStateFile::default()
        };

        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Snapshot for one symbol as loaded from disk (if any).
    pub fn symbol_snapshot(&self, symbol: &str) -> Option<SymbolStateSnapshot> {
        self.inner.lock().symbols.get(symbol).cloned()
    }

    /// Replace one symbol's snapshot and rewrite the whole file atomically.
    pub fn persist_symbol(&self, symbol: &str, mut snapshot: SymbolStateSnapshot) -> Result<()> {
        snapshot.timestamp = Utc::now().to_rfc3339();

        let mut state = self.inner.lock();
        state.symbols.insert(symbol.to_string(), snapshot);
        self.write_atomic(&state)
    }

    /// Atomic write: serialize to a tmp sibling, fsync, rename over target.
    fn write_atomic(&self, state: &BotStateFile) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .context("failed to serialise bot state to JSON")?;

        let tmp_path = self.path.with_extension("json.tmp");

        let mut file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp state {}", tmp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write tmp state {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync tmp state {}", tmp_path.display()))?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp state to {}", self.path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("symbols", &self.inner.lock().symbols.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Emergency-stop flag
// ---------------------------------------------------------------------------

/// JSON payload written into the hidden emergency-stop file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopRecord {
    pub timestamp: String,
    pub account_id: u16,
    #[serde(default)]
    pub symbol: Option<String>,
    pub reason: String,
    /// Free-form diagnostic block: retry counts, elapsed, exchange vs local
    /// quantities, trigger history, current price.
    #[serde(default)]
    pub diagnostic: Option<serde_json::Value>,
}

/// Path of the hidden flag file for an account.
pub fn emergency_stop_path(data_dir: impl AsRef<Path>, account_tag: &str) -> PathBuf {
    data_dir.as_ref().join(format!(".{account_tag}_emergency_stop"))
}

/// Whether the account is barred from starting.
pub fn emergency_stop_present(data_dir: impl AsRef<Path>, account_tag: &str) -> bool {
    emergency_stop_path(data_dir, account_tag).exists()
}

/// Write the emergency-stop flag. Never overwrites an existing flag — the
/// first recorded reason is the one the operator needs to see.
pub fn write_emergency_stop(
    data_dir: impl AsRef<Path>,
    account_tag: &str,
    account_id: u16,
    symbol: Option<&str>,
    reason: &str,
    diagnostic: Option<serde_json::Value>,
) -> Result<()> {
    let path = emergency_stop_path(&data_dir, account_tag);
    if path.exists() {
        warn!(
            account = account_tag,
            reason,
            "emergency stop flag already present — keeping original record"
        );
        return Ok(());
    }

    std::fs::create_dir_all(data_dir.as_ref()).with_context(|| {
        format!("failed to create data dir {}", data_dir.as_ref().display())
    })?;

    let record = EmergencyStopRecord {
        timestamp: Utc::now().to_rfc3339(),
        account_id,
        symbol: symbol.map(|s| s.to_string()),
        reason: reason.to_string(),
        diagnostic,
    };

    let content = serde_json::to_string_pretty(&record)
        .context("failed to serialise emergency-stop record")?;
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write emergency stop to {}", path.display()))?;

    warn!(
        account = account_tag,
        reason,
        path = %path.display(),
        "EMERGENCY STOP flag written — startup is barred until it is removed"
    );
    Ok(())
}

/// Read the flag's record for diagnostics, if present and parseable.
pub fn read_emergency_stop(
    data_dir: impl AsRef<Path>,
    account_tag: &str,
) -> Option<EmergencyStopRecord> {
    let path = emergency_stop_path(data_dir, account_tag);
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lattice-persist-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(level: u32, qty: f64, price: f64) -> GridEntry {
        GridEntry {
            grid_level: level,
            qty_coins: qty,
            entry_price: price,
            order_id: Some(format!("oid-{level}")),
            opened_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn persist_and_reload_roundtrip() {
        let dir = temp_dir("roundtrip");

        let store = StateStore::open(&dir, "001").unwrap();
        let mut snap = SymbolStateSnapshot {
            long: vec![entry(0, 300.0, 0.25), entry(1, 600.0, 0.2475)],
            short: vec![entry(0, 300.0, 0.25)],
            tp_long: Some("tp-long-id".to_string()),
            tp_short: None,
            ..Default::default()
        };
        snap.reference_qty_per_level.insert(0, 300.0);
        store.persist_symbol("DOGEUSDT", snap.clone()).unwrap();
        drop(store);

        let reloaded = StateStore::open(&dir, "001").unwrap();
        let got = reloaded.symbol_snapshot("DOGEUSDT").unwrap();
        assert_eq!(got.long, snap.long);
        assert_eq!(got.short, snap.short);
        assert_eq!(got.tp_long, snap.tp_long);
        assert_eq!(got.reference_qty_per_level.get(&0), Some(&300.0));
        assert!(!got.timestamp.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = temp_dir("tmpfile");
        let store = StateStore::open(&dir, "002").unwrap();
        store
            .persist_symbol("TONUSDT", SymbolStateSnapshot::default())
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "tmp file must be renamed away");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn emergency_stop_gate() {
        let dir = temp_dir("estop");
        assert!(!emergency_stop_present(&dir, "003"));

        write_emergency_stop(
            &dir,
            "003",
            3,
            Some("DOGEUSDT"),
            "STATE_MISMATCH",
            Some(serde_json::json!({"retries": 3, "exchange_qty": 100.0, "local_qty": 50.0})),
        )
        .unwrap();

        assert!(emergency_stop_present(&dir, "003"));
        let record = read_emergency_stop(&dir, "003").unwrap();
        assert_eq!(record.account_id, 3);
        assert_eq!(record.reason, "STATE_MISMATCH");
        assert_eq!(record.symbol.as_deref(), Some("DOGEUSDT"));

        // File name is hidden (dot-prefixed).
        let path = emergency_stop_path(&dir, "003");
        assert!(path.file_name().unwrap().to_string_lossy().starts_with('.'));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn emergency_stop_never_overwrites() {
        let dir = temp_dir("estop-keep");
        write_emergency_stop(&dir, "004", 4, None, "FIRST", None).unwrap();
        write_emergency_stop(&dir, "004", 4, None, "SECOND", None).unwrap();
        let record = read_emergency_stop(&dir, "004").unwrap();
        assert_eq!(record.reason, "FIRST");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
