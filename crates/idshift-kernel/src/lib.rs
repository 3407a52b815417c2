//! SQLite persistence for flags, identities, rollout state and the event journal.
//!
//! Every call opens its own connection, so the kernel is cheap to clone and
//! safe to share across tasks. Atomicity comes from SQLite itself: primary
//! keys for create-if-absent and username uniqueness, and a guarded `UPDATE`
//! inside an immediate transaction for rollout compare-and-set.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use idshift_core::{FeatureFlag, FlagWrite, Identity, InsertOutcome, Pathway, RolloutStage, RolloutState};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod store;

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("idshift.sqlite");
        // Busy timeout (default 5000ms; override with IDSHIFT_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("IDSHIFT_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let kernel = Self {
            db_path,
            busy: Duration::from_millis(busy_ms),
        };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS feature_flags (
              name TEXT PRIMARY KEY,
              enabled INTEGER NOT NULL,
              description TEXT NOT NULL,
              last_modified_by TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            -- One row per claimed username, whichever pathway created it
            CREATE TABLE IF NOT EXISTS identities (
              username TEXT PRIMARY KEY,
              display_name TEXT NOT NULL,
              owner_id TEXT NOT NULL,
              domain TEXT NOT NULL,
              verified INTEGER NOT NULL DEFAULT 0,
              pathway TEXT NOT NULL,
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_identities_owner ON identities(owner_id);

            -- Singleton rollout record; stage/cycle duplicated out of the JSON for CAS
            CREATE TABLE IF NOT EXISTS rollout_state (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              stage TEXT NOT NULL,
              cycle INTEGER NOT NULL,
              state TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Flags ----------------

    pub fn read_flag(&self, name: &str) -> Result<Option<FeatureFlag>> {
        let conn = self.conn()?;
        Self::select_flag(&conn, name)
    }

    fn select_flag(conn: &Connection, name: &str) -> Result<Option<FeatureFlag>> {
        let flag = conn
            .query_row(
                "SELECT name,enabled,description,last_modified_by,updated FROM feature_flags WHERE name=?",
                params![name],
                |row| {
                    Ok(FeatureFlag {
                        name: row.get(0)?,
                        enabled: row.get(1)?,
                        description: row.get(2)?,
                        last_modified_by: row.get(3)?,
                        updated_at: row.get::<_, DateTime<Utc>>(4)?,
                    })
                },
            )
            .optional()?;
        Ok(flag)
    }

    pub fn insert_flag(&self, flag: &FeatureFlag) -> Result<InsertOutcome<FeatureFlag>> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO feature_flags(name,enabled,description,last_modified_by,updated) VALUES(?,?,?,?,?) ON CONFLICT(name) DO NOTHING",
            params![
                flag.name,
                flag.enabled,
                flag.description,
                flag.last_modified_by,
                flag.updated_at
            ],
        )?;
        if inserted == 1 {
            return Ok(InsertOutcome::Created(flag.clone()));
        }
        let existing = Self::select_flag(&conn, &flag.name)?
            .ok_or_else(|| anyhow!("flag {} vanished after conflicting insert", flag.name))?;
        Ok(InsertOutcome::Existing(existing))
    }

    pub fn update_flag_enabled(
        &self,
        name: &str,
        enabled: bool,
        modified_by: &str,
    ) -> Result<Option<FeatureFlag>> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE feature_flags SET enabled=?, last_modified_by=?, updated=? WHERE name=?",
            params![enabled, modified_by, Utc::now(), name],
        )?;
        if n == 0 {
            return Ok(None);
        }
        Self::select_flag(&conn, name)
    }

    // ---------------- Identities ----------------

    /// Returns `false` when the username is already claimed.
    pub fn reserve_identity(&self, identity: &Identity) -> Result<bool> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO identities(username,display_name,owner_id,domain,verified,pathway,created) VALUES(?,?,?,?,?,?,?)",
            params![
                identity.username,
                identity.display_name,
                identity.owner_id,
                identity.domain,
                identity.verified,
                identity.pathway.as_str(),
                identity.created_at
            ],
        );
        match res {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn release_identity(&self, username: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM identities WHERE username=?", params![username])?;
        Ok(n > 0)
    }

    pub fn get_identity(&self, username: &str) -> Result<Option<Identity>> {
        let conn = self.conn()?;
        Self::select_identity(&conn, username)
    }

    fn select_identity(conn: &Connection, username: &str) -> Result<Option<Identity>> {
        let row = conn
            .query_row(
                "SELECT username,display_name,owner_id,domain,verified,pathway,created FROM identities WHERE username=?",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, DateTime<Utc>>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((username, display_name, owner_id, domain, verified, pathway, created_at)) = row
        else {
            return Ok(None);
        };
        let pathway = Pathway::from_slug(&pathway)
            .ok_or_else(|| anyhow!("unknown pathway `{}` for {}", pathway, username))?;
        Ok(Some(Identity {
            username,
            display_name,
            owner_id,
            domain,
            verified,
            created_at,
            pathway,
        }))
    }

    pub fn set_identity_verified(&self, username: &str, verified: bool) -> Result<Option<Identity>> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE identities SET verified=? WHERE username=?",
            params![verified, username],
        )?;
        if n == 0 {
            return Ok(None);
        }
        Self::select_identity(&conn, username)
    }

    pub fn count_identities(&self) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get(0))?;
        Ok(n)
    }

    // ---------------- Rollout ----------------

    pub fn read_rollout(&self) -> Result<Option<RolloutState>> {
        let conn = self.conn()?;
        Self::select_rollout(&conn)
    }

    fn select_rollout(conn: &Connection) -> Result<Option<RolloutState>> {
        let raw: Option<String> = conn
            .query_row("SELECT state FROM rollout_state WHERE id=1", [], |r| r.get(0))
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn insert_rollout_if_absent(&self, initial: &RolloutState) -> Result<RolloutState> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO rollout_state(id,stage,cycle,state,updated) VALUES(1,?,?,?,?) ON CONFLICT(id) DO NOTHING",
            params![
                initial.stage.as_str(),
                initial.cycle,
                serde_json::to_string(initial)?,
                Utc::now()
            ],
        )?;
        Self::select_rollout(&conn)?.ok_or_else(|| anyhow!("rollout state missing after init"))
    }

    /// Replaces the rollout record only if it is still at `expected`; the
    /// optional flag write commits in the same transaction.
    pub fn cas_rollout(
        &self,
        expected: (RolloutStage, u32),
        next: &RolloutState,
        flag: Option<&FlagWrite>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let n = tx.execute(
            "UPDATE rollout_state SET stage=?, cycle=?, state=?, updated=? WHERE id=1 AND stage=? AND cycle=?",
            params![
                next.stage.as_str(),
                next.cycle,
                serde_json::to_string(next)?,
                now,
                expected.0.as_str(),
                expected.1
            ],
        )?;
        if n == 0 {
            return Ok(false);
        }
        if let Some(write) = flag {
            tx.execute(
                "INSERT INTO feature_flags(name,enabled,description,last_modified_by,updated) VALUES(?,?,'',?,?) \
                 ON CONFLICT(name) DO UPDATE SET enabled=excluded.enabled, last_modified_by=excluded.last_modified_by, updated=excluded.updated",
                params![write.name, write.enabled, write.modified_by, now],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    // ---------------- Events ----------------

    pub fn append_event(&self, env: &idshift_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&env.payload).unwrap_or("{}".to_string());
        conn.execute(
            "INSERT INTO events(time,kind,payload) VALUES (?,?,?)",
            params![env.time, env.kind, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent `limit` events in ascending id order.
    /// Newest `limit` events, returned oldest first. `kind_prefix` filters
    /// before the limit applies.
    pub fn recent_events(&self, limit: i64, kind_prefix: Option<&str>) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,time,kind,payload FROM events \
             WHERE ?1 IS NULL OR substr(kind, 1, length(?1)) = ?1 \
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![kind_prefix, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_s: String = row.get(3)?;
            out.push(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        out.reverse();
        Ok(out)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Kernel) -> Result<T> + Send + 'static,
    {
        let k = self.clone();
        tokio::task::spawn_blocking(move || f(&k))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn append_event_async(&self, env: &idshift_events::Envelope) -> Result<i64> {
        let env = env.clone();
        self.blocking(move |k| k.append_event(&env)).await
    }

    pub async fn recent_events_async(
        &self,
        limit: i64,
        kind_prefix: Option<String>,
    ) -> Result<Vec<EventRow>> {
        self.blocking(move |k| k.recent_events(limit, kind_prefix.as_deref()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idshift_core::FlagDefaults;

    fn kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempfile::tempdir().expect("tempdir");
        let k = Kernel::open(dir.path()).expect("open");
        (dir, k)
    }

    fn identity(username: &str, pathway: Pathway) -> Identity {
        Identity {
            username: username.into(),
            display_name: "Someone".into(),
            owner_id: "owner-1".into(),
            domain: "identity.local".into(),
            verified: false,
            created_at: Utc::now(),
            pathway,
        }
    }

    #[test]
    fn flag_insert_is_create_if_absent() {
        let (_dir, k) = kernel();
        let flag = FeatureFlag::new("identity.function_pathway", &FlagDefaults::default(), Utc::now());
        assert!(k.insert_flag(&flag).expect("insert").was_created());

        let mut other = flag.clone();
        other.enabled = true;
        other.description = "second".into();
        let outcome = k.insert_flag(&other).expect("insert again");
        assert_eq!(outcome, InsertOutcome::Existing(flag.clone()));
        assert_eq!(k.read_flag(&flag.name).expect("get"), Some(flag));
    }

    #[test]
    fn set_flag_enabled_requires_record() {
        let (_dir, k) = kernel();
        assert!(k.update_flag_enabled("missing", true, "ops").expect("update").is_none());
        let flag = FeatureFlag::new("f", &FlagDefaults::default(), Utc::now());
        k.insert_flag(&flag).expect("insert");
        let updated = k.update_flag_enabled("f", true, "ops").expect("update").expect("present");
        assert!(updated.enabled);
        assert_eq!(updated.last_modified_by, "ops");
    }

    #[test]
    fn usernames_are_unique_across_pathways() {
        let (_dir, k) = kernel();
        assert!(k.reserve_identity(&identity("shared", Pathway::Legacy)).expect("first"));
        assert!(!k.reserve_identity(&identity("shared", Pathway::Function)).expect("second"));
        let stored = k.get_identity("shared").expect("get").expect("present");
        assert_eq!(stored.pathway, Pathway::Legacy);

        assert!(k.release_identity("shared").expect("release"));
        assert!(k.reserve_identity(&identity("shared", Pathway::Function)).expect("after release"));
    }

    #[test]
    fn verification_round_trips() {
        let (_dir, k) = kernel();
        k.reserve_identity(&identity("verify.me", Pathway::Function)).expect("reserve");
        let v = k.set_identity_verified("verify.me", true).expect("set").expect("present");
        assert!(v.verified);
        assert!(k.set_identity_verified("nobody", true).expect("set").is_none());
    }

    #[test]
    fn concurrent_reservations_have_one_winner() {
        let (_dir, k) = kernel();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let k = k.clone();
                let pathway = if i % 2 == 0 { Pathway::Legacy } else { Pathway::Function };
                std::thread::spawn(move || k.reserve_identity(&identity("race", pathway)))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("join").expect("reserve"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(k.count_identities().expect("count"), 1);
    }

    #[test]
    fn rollout_swap_is_compare_and_set() {
        let (_dir, k) = kernel();
        let initial = RolloutState::initial(Utc::now());
        let stored = k.insert_rollout_if_absent(&initial).expect("init");
        assert_eq!(stored, initial);
        // Second init leaves the record alone.
        let mut other = initial.clone();
        other.cycle = 9;
        assert_eq!(k.insert_rollout_if_absent(&other).expect("init again"), initial);

        let next = initial.enter(RolloutStage::Canary, Utc::now(), "ops");
        let write = FlagWrite {
            name: "identity.function_pathway".into(),
            enabled: true,
            modified_by: "ops".into(),
        };
        assert!(k.cas_rollout(initial.version(), &next, Some(&write)).expect("swap"));
        assert!(!k.cas_rollout(initial.version(), &next, None).expect("stale swap"));
        assert_eq!(k.read_rollout().expect("load"), Some(next));
        let flag = k.read_flag("identity.function_pathway").expect("get").expect("upserted");
        assert!(flag.enabled);
    }

    #[test]
    fn failed_swap_leaves_flag_untouched() {
        let (_dir, k) = kernel();
        let initial = RolloutState::initial(Utc::now());
        k.insert_rollout_if_absent(&initial).expect("init");
        let next = initial.enter(RolloutStage::Canary, Utc::now(), "ops");
        let write = FlagWrite {
            name: "f".into(),
            enabled: true,
            modified_by: "ops".into(),
        };
        assert!(!k
            .cas_rollout((RolloutStage::Monitoring, 1), &next, Some(&write))
            .expect("swap"));
        assert!(k.read_flag("f").expect("get").is_none());
    }

    #[tokio::test]
    async fn events_are_journaled_in_order() {
        let (_dir, k) = kernel();
        let bus = idshift_events::Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("identity.created", &serde_json::json!({"username": "a"}));
        bus.publish("identity.created", &serde_json::json!({"username": "b"}));
        for env in idshift_events::Bus::drain(&mut rx) {
            k.append_event_async(&env).await.expect("append");
        }
        let rows = k.recent_events_async(10, None).await.expect("recent");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload["username"], "a");
        assert_eq!(rows[1].payload["username"], "b");
        assert_eq!(k.recent_events(1, None).expect("recent").len(), 1);
    }

    #[test]
    fn kind_prefix_filters_before_limit() {
        let (_dir, k) = kernel();
        let bus = idshift_events::Bus::new(16);
        let mut rx = bus.subscribe();
        bus.publish("rollout.stage.changed", &serde_json::json!({"n": 1}));
        bus.publish("rollout.rolled_back", &serde_json::json!({"n": 2}));
        for n in 0..5 {
            bus.publish("identity.created", &serde_json::json!({"n": 10 + n}));
        }
        bus.publish("rollout_like", &serde_json::json!({"n": 99}));
        for env in idshift_events::Bus::drain(&mut rx) {
            k.append_event(&env).expect("append");
        }
        let rows = k.recent_events(2, Some("rollout.")).expect("recent");
        let kinds: Vec<_> = rows.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, ["rollout.stage.changed", "rollout.rolled_back"]);
        assert_eq!(k.recent_events(3, Some("identity.")).expect("recent").len(), 3);
        assert_eq!(k.recent_events(10, None).expect("recent").len(), 8);
    }
}
