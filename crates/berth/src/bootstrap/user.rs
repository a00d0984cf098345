//! User resolution and privilege drop.
//!
//! The group id MUST be set before the user id: once the uid is dropped the
//! process no longer has the right to change its gid, and a process that
//! drops uid first keeps its privileged group.

use std::path::Path;

use berth_common::{BerthError, BerthResult};

use super::Step;
use super::syscall::Syscall;

/// Location of the user database inside the container.
pub const PASSWD_PATH: &str = "/etc/passwd";

/// A resolved user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
}

/// Parse one `name:passwd:uid:gid:gecos:home:shell` line.
fn parse_passwd_line(line: &str) -> Option<UserEntry> {
    let mut fields = line.split(':');
    let name = fields.next()?;
    let _password = fields.next()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    Some(UserEntry {
        name: name.to_string(),
        uid,
        gid,
    })
}

/// Find `user` (a name or a numeric uid) in passwd-formatted `content`.
///
/// Only users present in the database resolve; a bare uid is never given
/// a made-up group.
///
/// # Errors
///
/// Returns a bootstrap error if the user is unknown.
pub fn find_user(user: &str, content: &str) -> BerthResult<UserEntry> {
    let numeric: Option<u32> = user.parse().ok();

    let found = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_passwd_line)
        .find(|entry| entry.name == user || Some(entry.uid) == numeric);

    found.ok_or_else(|| {
        BerthError::bootstrap(Step::Privileges, format!("Unable to find user {user}"))
    })
}

/// Resolve `user` against the passwd file at `passwd`.
///
/// # Errors
///
/// Returns a bootstrap error if the file cannot be read or the user is unknown.
pub fn lookup_user(user: &str, passwd: &Path) -> BerthResult<UserEntry> {
    let content = std::fs::read_to_string(passwd).map_err(|e| {
        BerthError::bootstrap(
            Step::Privileges,
            format!("Unable to find user {user}: {}: {e}", passwd.display()),
        )
    })?;
    find_user(user, &content)
}

/// Proof that the group id has already been dropped.
#[derive(Debug)]
#[must_use]
pub struct GroupDropped {
    gid: u32,
}

/// Drop supplementary groups and set the gid.
///
/// # Errors
///
/// Returns a bootstrap error if either syscall fails.
pub fn drop_group<S: Syscall + ?Sized>(sys: &S, gid: u32) -> BerthResult<GroupDropped> {
    sys.clear_groups().map_err(|e| {
        BerthError::bootstrap(Step::Privileges, format!("setgroups failed: {e}"))
    })?;
    sys.set_gid(gid)
        .map_err(|e| BerthError::bootstrap(Step::Privileges, format!("setgid failed: {e}")))?;
    Ok(GroupDropped { gid })
}

/// Set the uid. Requires the group to have been dropped first.
///
/// # Errors
///
/// Returns a bootstrap error if the syscall fails.
pub fn drop_user<S: Syscall + ?Sized>(sys: &S, group: GroupDropped, uid: u32) -> BerthResult<()> {
    sys.set_uid(uid)
        .map_err(|e| BerthError::bootstrap(Step::Privileges, format!("setuid failed: {e}")))?;
    tracing::debug!(uid, gid = group.gid, "Privileges dropped");
    Ok(())
}

/// Resolve `user` and switch the process to it.
///
/// # Errors
///
/// Returns a bootstrap error if resolution or any privilege change fails.
pub fn change_user<S: Syscall + ?Sized>(sys: &S, user: Option<&str>) -> BerthResult<()> {
    let Some(user) = user.filter(|u| !u.is_empty()) else {
        return Ok(());
    };

    let entry = sys.lookup_user(user)?;
    let group = drop_group(sys, entry.gid)?;
    drop_user(sys, group, entry.uid)
}

#[cfg(test)]
mod tests {
    use super::super::syscall::test::{Call, RecordingSyscall, check_privilege_order};
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
# comment
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
www-data:x:33:34:www-data:/var/www:/usr/sbin/nologin
broken:x:notanumber:1::/:/bin/sh
";

    #[test]
    fn find_by_name_and_uid() {
        assert_eq!(find_user("www-data", PASSWD).unwrap().gid, 34);
        let by_uid = find_user("33", PASSWD).unwrap();
        assert_eq!(by_uid.name, "www-data");
        assert_eq!((by_uid.uid, by_uid.gid), (33, 34));
    }

    #[test]
    fn unknown_numeric_uid_is_rejected() {
        let err = find_user("4242", PASSWD).unwrap_err();
        assert!(matches!(err, BerthError::Bootstrap { .. }));
        assert!(err.to_string().contains("Unable to find user 4242"));
    }

    #[test]
    fn unknown_name_and_malformed_lines_fail() {
        assert!(find_user("nobody", PASSWD).is_err());
        assert!(find_user("broken", PASSWD).is_err());
    }

    #[test]
    fn lookup_reads_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), PASSWD).unwrap();
        assert_eq!(lookup_user("daemon", temp.path()).unwrap().uid, 1);
    }

    #[test]
    fn missing_user_database_is_fatal() {
        let err = lookup_user("0", Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, BerthError::Bootstrap { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn change_user_sets_gid_before_uid() {
        let mut sys = RecordingSyscall::default();
        sys.users.insert(
            "www-data".into(),
            UserEntry {
                name: "www-data".into(),
                uid: 33,
                gid: 34,
            },
        );

        change_user(&sys, Some("www-data")).unwrap();

        let calls = sys.calls();
        assert_eq!(
            calls,
            vec![
                Call::LookupUser("www-data".into()),
                Call::ClearGroups,
                Call::SetGid(34),
                Call::SetUid(33),
            ]
        );
        check_privilege_order(&calls).unwrap();
    }

    #[test]
    fn failed_setgid_never_reaches_setuid() {
        let mut sys = RecordingSyscall {
            fail_set_gid: true,
            ..Default::default()
        };
        sys.users.insert(
            "1000".into(),
            UserEntry {
                name: String::new(),
                uid: 1000,
                gid: 1000,
            },
        );

        assert!(change_user(&sys, Some("1000")).is_err());
        assert!(!sys.calls().contains(&Call::SetUid(1000)));
    }

    #[test]
    fn unknown_user_is_fatal() {
        let sys = RecordingSyscall::default();
        assert!(change_user(&sys, Some("ghost")).is_err());
        check_privilege_order(&sys.calls()).unwrap();
    }

    #[test]
    fn no_user_is_a_no_op() {
        let sys = RecordingSyscall::default();
        change_user(&sys, None).unwrap();
        assert!(sys.calls().is_empty());
    }
}
