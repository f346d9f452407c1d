//! Team registry (`teams.db`, §6).
//!
//! Backed by `redb`, mirroring the structured index's table-per-relation
//! layout (`index.rs`). Membership reads take a shared lock; membership
//! changes take exclusive (§5) — modeled here with `std::sync::RwLock`
//! around the open `Database` handle since `redb` itself serializes writers,
//! plus an advisory whole-file lock on a `.lock` sidecar (§5: "Team-registry
//! and persona-registry state live in small files protected by advisory
//! whole-file locks during read-modify-write cycles") so a second *process*
//! opening the same `teams.db` can't race a write transaction, the way the
//! teacher's daemon guards its own pid file in `daemon.rs`.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubstrateError};

const TEAMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("teams");
const MEMBERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("team_members");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TeamRow {
    owner_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MembersRow {
    members: Vec<MemberRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberRow {
    ci_id: String,
    is_owner: bool,
    joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Team {
    pub team_name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub members: BTreeSet<String>,
}

pub struct TeamRegistry {
    db: RwLock<Database>,
    path: PathBuf,
    lock_path: PathBuf,
}

impl TeamRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;
        {
            let tx = db.begin_write()?;
            tx.open_table(TEAMS_TABLE)?;
            tx.open_table(MEMBERS_TABLE)?;
            tx.commit()?;
        }
        let mut lock_path = path.clone();
        lock_path.set_extension("db.lock");
        Ok(Self {
            db: RwLock::new(db),
            path,
            lock_path,
        })
    }

    /// Acquire the advisory whole-file lock for the duration of `f`, a
    /// membership read-modify-write cycle. Released automatically when the
    /// lock file handle drops at the end of the call.
    fn with_exclusive_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_file = File::create(&self.lock_path)?;
        lock_file
            .lock_exclusive()
            .map_err(|e| SubstrateError::StorageFailure(format!("team registry lock: {e}")))?;
        let result = f();
        let _ = lock_file.unlock();
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `team_create(team_name, owner)`.
    pub fn create(&self, team_name: &str, owner_id: &str) -> Result<()> {
        self.with_exclusive_lock(|| self.create_locked(team_name, owner_id))
    }

    fn create_locked(&self, team_name: &str, owner_id: &str) -> Result<()> {
        if team_name.is_empty() || owner_id.is_empty() {
            return Err(SubstrateError::bad_input("team_name and owner_id must not be empty"));
        }
        let db = self.db.write().map_err(|_| lock_poisoned())?;
        let tx = db.begin_write()?;
        {
            let tbl = tx.open_table(TEAMS_TABLE)?;
            if tbl.get(team_name)?.is_some() {
                return Err(SubstrateError::Duplicate(format!(
                    "team '{team_name}' already exists"
                )));
            }
        }
        let now = Utc::now();
        {
            let mut tbl = tx.open_table(TEAMS_TABLE)?;
            let row = TeamRow {
                owner_id: owner_id.to_string(),
                created_at: now,
            };
            tbl.insert(team_name, bincode_encode(&row)?.as_slice())?;
        }
        {
            let mut members = tx.open_table(MEMBERS_TABLE)?;
            let row = MembersRow {
                members: vec![MemberRow {
                    ci_id: owner_id.to_string(),
                    is_owner: true,
                    joined_at: now,
                }],
            };
            members.insert(team_name, bincode_encode(&row)?.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// `team_join(team_name, ci, requested_by)`. Policy: any current member
    /// or the owner may invite; this substrate (no separate invite workflow
    /// in scope) allows the owner to add members directly, matching the
    /// single-hop examples in §8.
    pub fn join(&self, team_name: &str, ci_id: &str, requested_by: &str) -> Result<()> {
        self.with_exclusive_lock(|| self.join_locked(team_name, ci_id, requested_by))
    }

    fn join_locked(&self, team_name: &str, ci_id: &str, requested_by: &str) -> Result<()> {
        let db = self.db.write().map_err(|_| lock_poisoned())?;
        let tx = db.begin_write()?;
        let team = {
            let tbl = tx.open_table(TEAMS_TABLE)?;
            let Some(bytes) = tbl.get(team_name)? else {
                return Err(SubstrateError::NotFound(format!("team '{team_name}' not found")));
            };
            bincode_decode::<TeamRow>(bytes.value())?
        };

        let mut members = tx.open_table(MEMBERS_TABLE)?;
        let mut row = members
            .get(team_name)?
            .map(|v| bincode_decode::<MembersRow>(v.value()))
            .transpose()?
            .unwrap_or(MembersRow { members: vec![] });

        let requester_is_member =
            requested_by == team.owner_id || row.members.iter().any(|m| m.ci_id == requested_by);
        if !requester_is_member {
            return Err(SubstrateError::AccessDenied(format!(
                "{requested_by} may not invite members to '{team_name}'"
            )));
        }
        if row.members.iter().any(|m| m.ci_id == ci_id) {
            return Err(SubstrateError::Duplicate(format!(
                "{ci_id} is already a member of '{team_name}'"
            )));
        }

        row.members.push(MemberRow {
            ci_id: ci_id.to_string(),
            is_owner: false,
            joined_at: Utc::now(),
        });
        members.insert(team_name, bincode_encode(&row)?.as_slice())?;
        drop(members);
        tx.commit()?;
        Ok(())
    }

    /// `team_leave(team_name, ci)`. The owner cannot leave (must delete).
    pub fn leave(&self, team_name: &str, ci_id: &str) -> Result<()> {
        self.with_exclusive_lock(|| self.leave_locked(team_name, ci_id))
    }

    fn leave_locked(&self, team_name: &str, ci_id: &str) -> Result<()> {
        let db = self.db.write().map_err(|_| lock_poisoned())?;
        let tx = db.begin_write()?;
        let team = {
            let tbl = tx.open_table(TEAMS_TABLE)?;
            let Some(bytes) = tbl.get(team_name)? else {
                return Err(SubstrateError::NotFound(format!("team '{team_name}' not found")));
            };
            bincode_decode::<TeamRow>(bytes.value())?
        };
        if team.owner_id == ci_id {
            return Err(SubstrateError::InvalidState(
                "the owner cannot leave a team — delete it instead".to_string(),
            ));
        }

        let mut members = tx.open_table(MEMBERS_TABLE)?;
        let mut row = members
            .get(team_name)?
            .map(|v| bincode_decode::<MembersRow>(v.value()))
            .transpose()?
            .unwrap_or(MembersRow { members: vec![] });
        let before = row.members.len();
        row.members.retain(|m| m.ci_id != ci_id);
        if row.members.len() == before {
            return Err(SubstrateError::NotFound(format!(
                "{ci_id} is not a member of '{team_name}'"
            )));
        }
        members.insert(team_name, bincode_encode(&row)?.as_slice())?;
        drop(members);
        tx.commit()?;
        Ok(())
    }

    /// `team_delete(team_name, requester)` — owner-only; removes all
    /// memberships.
    pub fn delete(&self, team_name: &str, requester: &str) -> Result<()> {
        self.with_exclusive_lock(|| self.delete_locked(team_name, requester))
    }

    fn delete_locked(&self, team_name: &str, requester: &str) -> Result<()> {
        let db = self.db.write().map_err(|_| lock_poisoned())?;
        let tx = db.begin_write()?;
        {
            let tbl = tx.open_table(TEAMS_TABLE)?;
            let Some(bytes) = tbl.get(team_name)? else {
                return Err(SubstrateError::NotFound(format!("team '{team_name}' not found")));
            };
            let team = bincode_decode::<TeamRow>(bytes.value())?;
            if team.owner_id != requester {
                return Err(SubstrateError::AccessDenied(format!(
                    "{requester} is not the owner of '{team_name}'"
                )));
            }
        }
        {
            let mut tbl = tx.open_table(TEAMS_TABLE)?;
            tbl.remove(team_name)?;
        }
        {
            let mut members = tx.open_table(MEMBERS_TABLE)?;
            members.remove(team_name)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// `team_list_members(team_name)`.
    pub fn list_members(&self, team_name: &str) -> Result<BTreeSet<String>> {
        let db = self.db.read().map_err(|_| lock_poisoned())?;
        let tx = db.begin_read()?;
        let tbl = tx.open_table(MEMBERS_TABLE)?;
        let Some(bytes) = tbl.get(team_name)? else {
            return Err(SubstrateError::NotFound(format!("team '{team_name}' not found")));
        };
        let row = bincode_decode::<MembersRow>(bytes.value())?;
        Ok(row.members.into_iter().map(|m| m.ci_id).collect())
    }

    /// `team_list_for_ci(ci)` — every team the CI owns or belongs to.
    pub fn list_for_ci(&self, ci_id: &str) -> Result<Vec<String>> {
        let db = self.db.read().map_err(|_| lock_poisoned())?;
        let tx = db.begin_read()?;
        let tbl = tx.open_table(MEMBERS_TABLE)?;
        let mut out = Vec::new();
        for entry in tbl.iter()? {
            let (key, value) = entry?;
            let row = bincode_decode::<MembersRow>(value.value())?;
            if row.members.iter().any(|m| m.ci_id == ci_id) {
                out.push(key.value().to_string());
            }
        }
        Ok(out)
    }

    /// `is_member(team_name, ci)` — used by the access-control check (§4.1).
    pub fn is_member(&self, team_name: &str, ci_id: &str) -> bool {
        self.list_members(team_name)
            .map(|members| members.contains(ci_id))
            .unwrap_or(false)
    }
}

fn lock_poisoned() -> SubstrateError {
    SubstrateError::StorageFailure("team registry lock poisoned".to_string())
}

fn bincode_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SubstrateError::StorageFailure(format!("encode error: {e}")))
}

fn bincode_decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| SubstrateError::StorageFailure(format!("decode error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry() -> (TeamRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = TeamRegistry::open(dir.path().join("teams.db")).unwrap();
        (registry, dir)
    }

    #[test]
    fn create_then_delete_then_recreate_succeeds() {
        let (reg, _dir) = temp_registry();
        reg.create("T", "alice").unwrap();
        reg.delete("T", "alice").unwrap();
        reg.create("T", "alice").unwrap();
    }

    #[test]
    fn owner_is_always_a_member() {
        let (reg, _dir) = temp_registry();
        reg.create("T", "alice").unwrap();
        assert!(reg.is_member("T", "alice"));
    }

    #[test]
    fn join_then_leave_round_trip() {
        let (reg, _dir) = temp_registry();
        reg.create("T", "alice").unwrap();
        reg.join("T", "bob", "alice").unwrap();
        assert!(reg.is_member("T", "bob"));
        reg.leave("T", "bob").unwrap();
        assert!(!reg.is_member("T", "bob"));
    }

    #[test]
    fn owner_cannot_leave() {
        let (reg, _dir) = temp_registry();
        reg.create("T", "alice").unwrap();
        let err = reg.leave("T", "alice").unwrap_err();
        assert_eq!(err.code(), "InvalidState");
    }

    #[test]
    fn duplicate_team_rejected() {
        let (reg, _dir) = temp_registry();
        reg.create("T", "alice").unwrap();
        let err = reg.create("T", "alice").unwrap_err();
        assert_eq!(err.code(), "Duplicate");
    }
}
