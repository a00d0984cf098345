//! Kernel interface used by the bootstrap sequence.
//!
//! Every side effect of the bootstrap goes through [`Syscall`] so that the
//! ordering of steps can be observed in tests with a recording fake.

#![allow(unsafe_code)]

use std::ffi::OsString;
use std::io;
use std::net::IpAddr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use berth_common::BerthResult;

use super::user::UserEntry;

/// Side effects performed while bootstrapping a container process.
pub trait Syscall {
    /// Remove every variable from the process environment.
    fn clear_env(&self);

    /// Set one environment variable.
    fn set_env(&self, key: &str, value: &str);

    /// Read the environment sentinel.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Install `gateway` as the default route of the current network namespace.
    fn add_default_route(&self, gateway: IpAddr) -> BerthResult<()>;

    /// Change the working directory.
    fn chdir(&self, path: &Path) -> io::Result<()>;

    /// Resolve a user name or numeric uid.
    fn lookup_user(&self, user: &str) -> BerthResult<UserEntry>;

    /// Drop supplementary groups.
    fn clear_groups(&self) -> io::Result<()>;

    /// Set the real, effective and saved group id.
    fn set_gid(&self, gid: u32) -> io::Result<()>;

    /// Set the real, effective and saved user id.
    fn set_uid(&self, uid: u32) -> io::Result<()>;

    /// Current value of an environment variable.
    fn env_var(&self, key: &str) -> Option<OsString>;

    /// Whether `path` is an executable regular file.
    fn is_executable(&self, path: &Path) -> bool;

    /// Replace the process image. Only returns on failure.
    fn exec(&self, path: &Path, argv: &[String]) -> io::Error;
}

/// The real Linux implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn clear_env(&self) {
        for (key, _) in std::env::vars_os() {
            // SAFETY: bootstrap runs on the only thread of the process, before
            // any runtime is started, so nothing reads the environment concurrently.
            unsafe { std::env::remove_var(key) };
        }
    }

    fn set_env(&self, key: &str, value: &str) {
        // SAFETY: see `clear_env`.
        unsafe { std::env::set_var(key, value) };
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn add_default_route(&self, gateway: IpAddr) -> BerthResult<()> {
        super::network::install_default_route(gateway)
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        std::env::set_current_dir(path)
    }

    fn lookup_user(&self, user: &str) -> BerthResult<UserEntry> {
        super::user::lookup_user(user, Path::new(super::user::PASSWD_PATH))
    }

    fn clear_groups(&self) -> io::Result<()> {
        // SAFETY: setgroups with a zero length list never reads the pointer.
        let result = unsafe { libc::setgroups(0, std::ptr::null()) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_gid(&self, gid: u32) -> io::Result<()> {
        // SAFETY: plain syscall wrapper; glibc applies it to every thread.
        let result = unsafe { libc::setgid(gid as libc::gid_t) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_uid(&self, uid: u32) -> io::Result<()> {
        // SAFETY: plain syscall wrapper; glibc applies it to every thread.
        let result = unsafe { libc::setuid(uid as libc::uid_t) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn env_var(&self, key: &str) -> Option<OsString> {
        std::env::var_os(key)
    }

    fn is_executable(&self, path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;

        std::fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    fn exec(&self, path: &Path, argv: &[String]) -> io::Error {
        let mut cmd = Command::new(path);
        if let Some((arg0, rest)) = argv.split_first() {
            cmd.arg0(arg0).args(rest);
        }
        cmd.exec()
    }
}

/// Resolve a program name the way `execvp` does.
pub fn lookup_program<S: Syscall + ?Sized>(sys: &S, name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        return sys.is_executable(&path).then_some(path);
    }

    let search = sys.env_var("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(name)
            } else {
                dir.join(name)
            }
        })
        .find(|candidate| sys.is_executable(candidate))
}

#[cfg(test)]
pub(crate) mod test {
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    use berth_common::BerthError;

    use super::*;

    /// A recorded side effect.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        ClearEnv,
        SetEnv(String, String),
        ReadFile(PathBuf),
        AddDefaultRoute(IpAddr),
        Chdir(PathBuf),
        LookupUser(String),
        ClearGroups,
        SetGid(u32),
        SetUid(u32),
        Exec(PathBuf, Vec<String>),
    }

    /// Records every call and fakes the outside world.
    #[derive(Default)]
    pub struct RecordingSyscall {
        pub calls: RefCell<Vec<Call>>,
        pub env: RefCell<HashMap<String, String>>,
        pub files: HashMap<PathBuf, Vec<u8>>,
        pub users: HashMap<String, UserEntry>,
        pub executables: HashSet<PathBuf>,
        pub missing_dirs: HashSet<PathBuf>,
        pub fail_route: bool,
        pub fail_set_gid: bool,
    }

    impl RecordingSyscall {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        fn record(&self, call: Call) {
            self.calls.borrow_mut().push(call);
        }
    }

    /// Rejects any call sequence that sets the uid before the gid.
    pub fn check_privilege_order(calls: &[Call]) -> Result<(), String> {
        let gid_at = calls.iter().position(|c| matches!(c, Call::SetGid(_)));
        let uid_at = calls.iter().position(|c| matches!(c, Call::SetUid(_)));
        match (gid_at, uid_at) {
            (_, None) => Ok(()),
            (Some(gid), Some(uid)) if gid < uid => Ok(()),
            _ => Err(format!("uid changed before gid: {calls:?}")),
        }
    }

    impl Syscall for RecordingSyscall {
        fn clear_env(&self) {
            self.record(Call::ClearEnv);
            self.env.borrow_mut().clear();
        }

        fn set_env(&self, key: &str, value: &str) {
            self.record(Call::SetEnv(key.to_string(), value.to_string()));
            self.env
                .borrow_mut()
                .insert(key.to_string(), value.to_string());
        }

        fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.record(Call::ReadFile(path.to_path_buf()));
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn add_default_route(&self, gateway: IpAddr) -> BerthResult<()> {
            self.record(Call::AddDefaultRoute(gateway));
            if self.fail_route {
                return Err(BerthError::bootstrap("network", "route rejected"));
            }
            Ok(())
        }

        fn chdir(&self, path: &Path) -> io::Result<()> {
            self.record(Call::Chdir(path.to_path_buf()));
            if self.missing_dirs.contains(path) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            Ok(())
        }

        fn lookup_user(&self, user: &str) -> BerthResult<UserEntry> {
            self.record(Call::LookupUser(user.to_string()));
            self.users
                .get(user)
                .cloned()
                .ok_or_else(|| BerthError::bootstrap("privileges", "no such user"))
        }

        fn clear_groups(&self) -> io::Result<()> {
            self.record(Call::ClearGroups);
            Ok(())
        }

        fn set_gid(&self, gid: u32) -> io::Result<()> {
            self.record(Call::SetGid(gid));
            if self.fail_set_gid {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            Ok(())
        }

        fn set_uid(&self, uid: u32) -> io::Result<()> {
            self.record(Call::SetUid(uid));
            Ok(())
        }

        fn env_var(&self, key: &str) -> Option<OsString> {
            self.env.borrow().get(key).map(OsString::from)
        }

        fn is_executable(&self, path: &Path) -> bool {
            self.executables.contains(path)
        }

        fn exec(&self, path: &Path, argv: &[String]) -> io::Error {
            self.record(Call::Exec(path.to_path_buf(), argv.to_vec()));
            io::Error::other("exec is not performed by the recording syscall")
        }
    }

    #[test]
    fn lookup_program_walks_path_in_order() {
        let sys = RecordingSyscall {
            executables: ["/usr/bin/cat", "/bin/cat"].iter().map(PathBuf::from).collect(),
            ..Default::default()
        };
        sys.set_env("PATH", "/usr/local/bin:/usr/bin:/bin");

        assert_eq!(
            lookup_program(&sys, "cat"),
            Some(PathBuf::from("/usr/bin/cat"))
        );
        assert_eq!(lookup_program(&sys, "missing"), None);
    }

    #[test]
    fn lookup_program_with_slash_skips_path() {
        let sys = RecordingSyscall {
            executables: [PathBuf::from("/opt/tool")].into_iter().collect(),
            ..Default::default()
        };

        assert_eq!(
            lookup_program(&sys, "/opt/tool"),
            Some(PathBuf::from("/opt/tool"))
        );
        assert_eq!(lookup_program(&sys, "/opt/other"), None);
        assert_eq!(lookup_program(&sys, "tool"), None);
    }

    #[test]
    fn privilege_order_check_rejects_uid_first() {
        let good = [Call::ClearGroups, Call::SetGid(1), Call::SetUid(1)];
        let bad = [Call::SetUid(1), Call::SetGid(1)];
        assert!(check_privilege_order(&good).is_ok());
        assert!(check_privilege_order(&bad).is_err());
        assert!(check_privilege_order(&[Call::SetUid(1)]).is_err());
    }
}
