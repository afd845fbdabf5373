//! POSIX account resolution and the allowed-account policy.
//!
//! Tasks run under a named OS account. An account is eligible when its
//! primary or any supplementary group id is in [`ALLOWED_ACCOUNT_GIDS`].
//! Resolution reads the system passwd/group databases as text (the same
//! files the libc iterators walk), which keeps the policy testable against
//! fixture files.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::warn;

/// Group ids whose members may own tasks: root plus the first two
/// conventional login groups.
pub const ALLOWED_ACCOUNT_GIDS: [u32; 3] = [0, 1000, 1001];

/// One passwd entry, reduced to what the runner needs.
#[derive(Debug, Clone)]
pub struct AccountEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// What to do about process credentials before spawning a task's script.
#[derive(Debug, Clone)]
pub enum Privileges {
    /// Child inherits the scheduler's own credentials.
    Inherit { home: Option<String> },
    /// Scheduler is root and drops to the task's account.
    Drop {
        uid: u32,
        gid: u32,
        groups: Vec<u32>,
        home: String,
    },
}

/// Read-only view over the system account databases.
#[derive(Debug, Clone)]
pub struct AccountDirectory {
    passwd_path: PathBuf,
    group_path: PathBuf,
}

impl Default for AccountDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountDirectory {
    pub fn new() -> Self {
        Self {
            passwd_path: PathBuf::from("/etc/passwd"),
            group_path: PathBuf::from("/etc/group"),
        }
    }

    /// Point the directory at alternative database files (tests).
    pub fn with_paths(passwd_path: impl Into<PathBuf>, group_path: impl Into<PathBuf>) -> Self {
        Self {
            passwd_path: passwd_path.into(),
            group_path: group_path.into(),
        }
    }

    /// Whether account switching is meaningful on this platform.
    pub fn posix_supported() -> bool {
        cfg!(unix)
    }

    /// Fallback account used when a client omits one: the configured
    /// override, else the login environment, else a placeholder.
    pub fn default_account() -> String {
        for key in ["TASKWHEEL_DEFAULT_ACCOUNT", "USER", "USERNAME", "LOGNAME"] {
            if let Ok(value) = std::env::var(key) {
                if !value.trim().is_empty() {
                    return value;
                }
            }
        }
        "current_user".to_string()
    }

    pub fn lookup(&self, name: &str) -> Option<AccountEntry> {
        self.passwd_entries().into_iter().find(|e| e.name == name)
    }

    pub fn lookup_uid(&self, uid: u32) -> Option<AccountEntry> {
        self.passwd_entries().into_iter().find(|e| e.uid == uid)
    }

    /// Gids of every group that lists `name` as a member.
    pub fn supplementary_gids(&self, name: &str) -> Vec<u32> {
        self.group_entries()
            .into_iter()
            .filter(|(_, members)| members.iter().any(|m| m == name))
            .map(|(gid, _)| gid)
            .collect()
    }

    /// Whether `name` is a member, primary or supplementary, of an allowed
    /// group.
    pub fn is_allowed(&self, name: &str) -> bool {
        if let Some(entry) = self.lookup(name) {
            if ALLOWED_ACCOUNT_GIDS.contains(&entry.gid) {
                return true;
            }
        }
        self.supplementary_gids(name)
            .iter()
            .any(|gid| ALLOWED_ACCOUNT_GIDS.contains(gid))
    }

    /// Distinct account names eligible to own tasks, sorted. On non-POSIX
    /// platforms this is just the default account.
    pub fn list_allowed(&self) -> Vec<String> {
        if !Self::posix_supported() {
            return vec![Self::default_account()];
        }

        let mut names: BTreeSet<String> = BTreeSet::new();
        for entry in self.passwd_entries() {
            if ALLOWED_ACCOUNT_GIDS.contains(&entry.gid) {
                names.insert(entry.name);
            }
        }
        for (gid, members) in self.group_entries() {
            if ALLOWED_ACCOUNT_GIDS.contains(&gid) {
                for member in members {
                    if !member.is_empty() {
                        names.insert(member);
                    }
                }
            }
        }
        names.into_iter().collect()
    }

    fn passwd_entries(&self) -> Vec<AccountEntry> {
        let Ok(raw) = std::fs::read_to_string(&self.passwd_path) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                // name:passwd:uid:gid:gecos:home:shell
                let fields: Vec<&str> = line.split(':').collect();
                if fields.len() < 6 {
                    return None;
                }
                Some(AccountEntry {
                    name: fields[0].to_string(),
                    uid: fields[2].parse().ok()?,
                    gid: fields[3].parse().ok()?,
                    home: fields[5].to_string(),
                })
            })
            .collect()
    }

    fn group_entries(&self) -> Vec<(u32, Vec<String>)> {
        let Ok(raw) = std::fs::read_to_string(&self.group_path) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                // name:passwd:gid:member,member
                let fields: Vec<&str> = line.split(':').collect();
                if fields.len() < 3 {
                    return None;
                }
                let gid: u32 = fields[2].parse().ok()?;
                let members = fields
                    .get(3)
                    .map(|m| m.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                Some((gid, members))
            })
            .collect()
    }
}

/// Decide the credentials for running a script as `account`.
///
/// Root resolves and drops to the account (membership in an allowed group
/// required); a non-root scheduler may only run tasks as itself. The error
/// string becomes the failed result's log — these failures are captured, not
/// raised.
pub fn resolve_privileges(
    directory: &AccountDirectory,
    account: &str,
) -> Result<Privileges, String> {
    if !AccountDirectory::posix_supported() {
        return Ok(Privileges::Inherit { home: None });
    }

    let entry = directory
        .lookup(account)
        .ok_or_else(|| format!("account '{account}' does not exist on this host"))?;

    let euid = effective_uid();
    if euid == entry.uid {
        return Ok(Privileges::Inherit {
            home: Some(entry.home),
        });
    }
    if euid != 0 {
        return Err(format!(
            "scheduler is not running as root and cannot switch to account '{account}'"
        ));
    }

    let supplementary = directory.supplementary_gids(account);
    let allowed = ALLOWED_ACCOUNT_GIDS.contains(&entry.gid)
        || supplementary.iter().any(|g| ALLOWED_ACCOUNT_GIDS.contains(g));
    if !allowed {
        warn!(account, "rejected account outside allowed groups");
        return Err(format!(
            "account '{account}' is not a member of an allowed group (0/1000/1001)"
        ));
    }

    let mut groups: BTreeSet<u32> = supplementary.into_iter().collect();
    groups.insert(entry.gid);

    Ok(Privileges::Drop {
        uid: entry.uid,
        gid: entry.gid,
        groups: groups.into_iter().collect(),
        home: entry.home,
    })
}

#[cfg(unix)]
fn effective_uid() -> u32 {
    // Safety: geteuid has no failure modes.
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
fn effective_uid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture_dir() -> (tempfile::TempDir, AccountDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let passwd = dir.path().join("passwd");
        let group = dir.path().join("group");

        let mut f = std::fs::File::create(&passwd).unwrap();
        writeln!(f, "root:x:0:0:root:/root:/bin/bash").unwrap();
        writeln!(f, "alice:x:1000:1000:Alice:/home/alice:/bin/bash").unwrap();
        writeln!(f, "bob:x:1002:1002:Bob:/home/bob:/bin/bash").unwrap();
        writeln!(f, "daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin").unwrap();
        writeln!(f, "# comment line").unwrap();
        writeln!(f, "broken-entry").unwrap();

        let mut g = std::fs::File::create(&group).unwrap();
        writeln!(g, "root:x:0:").unwrap();
        writeln!(g, "alice:x:1000:").unwrap();
        writeln!(g, "staff:x:1001:bob,carol").unwrap();
        writeln!(g, "other:x:2000:daemon").unwrap();

        let directory = AccountDirectory::with_paths(passwd, group);
        (dir, directory)
    }

    #[test]
    fn lookup_parses_passwd_fields() {
        let (_guard, dir) = fixture_dir();
        let alice = dir.lookup("alice").unwrap();
        assert_eq!(alice.uid, 1000);
        assert_eq!(alice.gid, 1000);
        assert_eq!(alice.home, "/home/alice");
        assert!(dir.lookup("nobody-here").is_none());
    }

    #[test]
    fn membership_covers_primary_and_supplementary_groups() {
        let (_guard, dir) = fixture_dir();
        // Primary gid 0 and 1000.
        assert!(dir.is_allowed("root"));
        assert!(dir.is_allowed("alice"));
        // bob's primary gid is 1002 but staff (1001) lists him.
        assert!(dir.is_allowed("bob"));
        // daemon is only in group 2000.
        assert!(!dir.is_allowed("daemon"));
    }

    #[test]
    fn allowed_list_is_sorted_and_distinct() {
        let (_guard, dir) = fixture_dir();
        let allowed = dir.list_allowed();
        assert_eq!(allowed, vec!["alice", "bob", "carol", "root"]);
    }

    #[test]
    fn unknown_account_cannot_run() {
        let (_guard, dir) = fixture_dir();
        let err = resolve_privileges(&dir, "ghost").unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[cfg(unix)]
    #[test]
    fn privilege_resolution_depends_on_effective_uid() {
        let (_guard, dir) = fixture_dir();
        if effective_uid() == 0 {
            // Root: disallowed-group accounts are rejected, eligible ones drop.
            let err = resolve_privileges(&dir, "daemon").unwrap_err();
            assert!(err.contains("allowed group"));
            match resolve_privileges(&dir, "bob").unwrap() {
                Privileges::Drop { uid, groups, .. } => {
                    assert_eq!(uid, 1002);
                    assert!(groups.contains(&1001) && groups.contains(&1002));
                }
                other => panic!("expected drop, got {other:?}"),
            }
        } else {
            // Pick a fixture account that is not the current user.
            let target = if effective_uid() == 1002 { "alice" } else { "bob" };
            let err = resolve_privileges(&dir, target).unwrap_err();
            assert!(err.contains("not running as root"));
        }
    }
}
