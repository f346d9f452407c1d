//! Access control policy engine over the record model (Component I, §4.1).

use crate::audit::AuditLog;
use crate::error::{Result, SubstrateError};
use crate::schema::{Isolation, Record};
use crate::teams::TeamRegistry;

/// `check_read(requester, record)`.
///
/// PUBLIC: always allowed. PRIVATE: owner only. TEAM: owner or member of
/// `record.team_name`. Denials are logged via `audit` with a one-sentence
/// explanation; the decision itself is a plain bool so that *query* callers
/// can filter silently (§4.1, §7) while *direct-read-by-id* callers can
/// still surface `AccessDenied`.
pub fn check_read(requester: &str, record: &Record, teams: &TeamRegistry, audit: &AuditLog) -> bool {
    let allowed = match record.isolation {
        Isolation::Public => true,
        Isolation::Private => requester == record.owner_id,
        Isolation::Team => {
            requester == record.owner_id
                || record
                    .team_name
                    .as_deref()
                    .map(|team| teams.is_member(team, requester))
                    .unwrap_or(false)
        }
    };

    if !allowed {
        audit.log_denial(
            requester,
            &record.record_id.to_string(),
            &explain_denial(requester, record),
        );
    }
    allowed
}

/// `check_read` for a direct-read-by-id path, returning `AccessDenied` with
/// an explanation instead of a bool (§7 "user-visible behavior").
pub fn check_read_or_deny(
    requester: &str,
    record: &Record,
    teams: &TeamRegistry,
    audit: &AuditLog,
) -> Result<()> {
    if check_read(requester, record, teams, audit) {
        Ok(())
    } else {
        Err(SubstrateError::AccessDenied(explain_denial(requester, record)))
    }
}

fn explain_denial(requester: &str, record: &Record) -> String {
    match record.isolation {
        Isolation::Public => unreachable!("PUBLIC records are never denied"),
        Isolation::Private => format!(
            "{requester} may not read private record owned by {}",
            record.owner_id
        ),
        Isolation::Team => format!(
            "{requester} is not a member of team '{}' that owns this record",
            record.team_name.as_deref().unwrap_or("?")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Isolation, RecordType};

    fn record(owner: &str, isolation: Isolation, team: Option<&str>) -> Record {
        Record::create(
            owner,
            RecordType::Observation,
            "secret",
            0.5,
            None,
            None,
            isolation,
            team.map(str::to_string),
        )
        .unwrap()
    }

    fn fixtures() -> (TeamRegistry, AuditLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let teams = TeamRegistry::open(dir.path().join("teams.db")).unwrap();
        let audit = AuditLog::open(dir.path().join("audit.jsonl"));
        (teams, audit, dir)
    }

    #[test]
    fn private_record_visible_only_to_owner() {
        let (teams, audit, _dir) = fixtures();
        let r = record("alice", Isolation::Private, None);
        assert!(check_read("alice", &r, &teams, &audit));
        assert!(!check_read("bob", &r, &teams, &audit));
    }

    #[test]
    fn team_visibility_tracks_membership() {
        let (teams, audit, _dir) = fixtures();
        teams.create("T", "alice").unwrap();
        let r = record("alice", Isolation::Team, Some("T"));
        assert!(!check_read("bob", &r, &teams, &audit));
        teams.join("T", "bob", "alice").unwrap();
        assert!(check_read("bob", &r, &teams, &audit));
        teams.leave("T", "bob").unwrap();
        assert!(!check_read("bob", &r, &teams, &audit));
    }

    #[test]
    fn public_record_always_visible() {
        let (teams, audit, _dir) = fixtures();
        let r = record("alice", Isolation::Public, None);
        assert!(check_read("bob", &r, &teams, &audit));
    }
}
