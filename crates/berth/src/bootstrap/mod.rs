//! Container process bootstrap.
//!
//! This is the first code that runs inside a new isolation context. It
//! rebuilds the environment from the sentinel file, installs the default
//! route, changes directory, drops privileges and finally replaces itself
//! with the requested program. Steps run strictly in that order and any
//! failure ends the bootstrap process.

pub mod env;
pub mod network;
pub mod syscall;
pub mod user;

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use berth_common::{BerthError, BerthResult, ENV_SENTINEL};

pub use syscall::{LinuxSyscall, Syscall, lookup_program};
pub use user::UserEntry;

/// Bootstrap steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Environment reset from the sentinel.
    Environment,
    /// Default route.
    Network,
    /// Working directory.
    Workdir,
    /// Privilege drop.
    Privileges,
    /// Program transfer.
    Exec,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Environment => write!(f, "environment"),
            Self::Network => write!(f, "network"),
            Self::Workdir => write!(f, "workdir"),
            Self::Privileges => write!(f, "privileges"),
            Self::Exec => write!(f, "exec"),
        }
    }
}

/// Options handed to the bootstrap by the launcher.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// User name or numeric uid to run as.
    pub user: Option<String>,
    /// Default gateway address.
    pub gateway: Option<String>,
    /// Working directory.
    pub workdir: Option<PathBuf>,
    /// Environment sentinel location.
    pub env_file: PathBuf,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            user: None,
            gateway: None,
            workdir: None,
            env_file: PathBuf::from(ENV_SENTINEL),
        }
    }
}

/// Change into `workdir` when one is given.
///
/// # Errors
///
/// Returns a bootstrap error if the directory cannot be entered.
pub fn setup_working_directory<S: Syscall + ?Sized>(
    sys: &S,
    workdir: Option<&Path>,
) -> BerthResult<()> {
    let Some(dir) = workdir.filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };

    sys.chdir(dir).map_err(|e| {
        BerthError::bootstrap(
            Step::Workdir,
            format!("Unable to change dir to {}: {e}", dir.display()),
        )
    })
}

/// Resolve `argv[0]` and replace the process with it.
///
/// # Errors
///
/// Returns [`BerthError::CommandNotFound`] if the program is not on the
/// search path, or a bootstrap error if the transfer itself fails.
pub fn execute_program<S: Syscall + ?Sized>(sys: &S, argv: &[String]) -> BerthResult<Infallible> {
    let name = argv
        .first()
        .ok_or_else(|| BerthError::bootstrap(Step::Exec, "no program given"))?;

    let path = lookup_program(sys, name).ok_or_else(|| BerthError::CommandNotFound {
        command: name.clone(),
    })?;

    tracing::debug!(program = %path.display(), "Transferring control");
    let err = sys.exec(&path, argv);
    Err(BerthError::bootstrap(Step::Exec, err))
}

/// The bootstrap sequence bound to a syscall implementation.
pub struct Bootstrap<'a, S: Syscall + ?Sized> {
    sys: &'a S,
    options: BootstrapOptions,
}

impl<'a, S: Syscall + ?Sized> Bootstrap<'a, S> {
    /// Create a bootstrap.
    pub fn new(sys: &'a S, options: BootstrapOptions) -> Self {
        Self { sys, options }
    }

    /// Run every step and transfer control to `argv`.
    ///
    /// Never returns `Ok`: on success the process image has been replaced.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn run(&self, argv: &[String]) -> BerthResult<Infallible> {
        env::reset_environment(self.sys, &self.options.env_file)?;
        network::setup_networking(self.sys, self.options.gateway.as_deref())?;
        setup_working_directory(self.sys, self.options.workdir.as_deref())?;
        user::change_user(self.sys, self.options.user.as_deref())?;
        execute_program(self.sys, argv)
    }
}

/// Entry point of `berth init`. Runs the bootstrap with the real kernel
/// interface and exits the process if any step fails.
pub fn sysinit(options: BootstrapOptions, argv: &[String]) -> ! {
    let sys = LinuxSyscall;
    let Err(err) = Bootstrap::new(&sys, options).run(argv);

    match &err {
        BerthError::CommandNotFound { .. } => tracing::error!("{err}"),
        _ => tracing::error!(error = %err, "Container bootstrap failed"),
    }
    std::process::exit(err.exit_code());
}

#[cfg(test)]
mod tests {
    use super::syscall::test::{Call, RecordingSyscall, check_privilege_order};
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    fn ready_syscall() -> RecordingSyscall {
        let mut sys = RecordingSyscall::default();
        sys.files.insert(
            PathBuf::from(ENV_SENTINEL),
            br#"["PATH=/usr/bin:/bin","HOME=/"]"#.to_vec(),
        );
        sys.users.insert(
            "daemon".into(),
            UserEntry {
                name: "daemon".into(),
                uid: 1,
                gid: 1,
            },
        );
        sys.executables.insert(PathBuf::from("/bin/cat"));
        sys
    }

    fn full_options() -> BootstrapOptions {
        BootstrapOptions {
            user: Some("daemon".into()),
            gateway: Some("10.0.0.1".into()),
            workdir: Some(PathBuf::from("/srv")),
            ..Default::default()
        }
    }

    #[test]
    fn steps_run_in_mandated_order() {
        let sys = ready_syscall();
        let result = Bootstrap::new(&sys, full_options()).run(&argv(&["cat", "-n"]));

        let Err(BerthError::Bootstrap { step, .. }) = result else {
            panic!("recording exec always fails");
        };
        assert_eq!(step, "exec");

        let calls = sys.calls();
        let kinds: Vec<&str> = calls
            .iter()
            .map(|c| match c {
                Call::ClearEnv => "clear",
                Call::ReadFile(_) => "read",
                Call::SetEnv(..) => "setenv",
                Call::AddDefaultRoute(_) => "route",
                Call::Chdir(_) => "chdir",
                Call::LookupUser(_) => "lookup",
                Call::ClearGroups => "groups",
                Call::SetGid(_) => "gid",
                Call::SetUid(_) => "uid",
                Call::Exec(..) => "exec",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "clear", "read", "setenv", "setenv", "route", "chdir", "lookup", "groups", "gid",
                "uid", "exec"
            ]
        );
        check_privilege_order(&calls).unwrap();
        assert_eq!(
            calls.last(),
            Some(&Call::Exec(PathBuf::from("/bin/cat"), argv(&["cat", "-n"])))
        );
    }

    #[test]
    fn missing_program_is_command_not_found() {
        let sys = ready_syscall();
        let err = Bootstrap::new(&sys, BootstrapOptions::default())
            .run(&argv(&["does-not-exist"]))
            .unwrap_err();

        assert!(matches!(err, BerthError::CommandNotFound { .. }));
        assert_eq!(err.exit_code(), 127);
        assert!(!sys.calls().iter().any(|c| matches!(c, Call::Exec(..))));
    }

    #[test]
    fn failing_step_stops_the_sequence() {
        let mut sys = ready_syscall();
        sys.missing_dirs.insert(PathBuf::from("/srv"));

        let err = Bootstrap::new(&sys, full_options())
            .run(&argv(&["cat"]))
            .unwrap_err();

        assert!(err.to_string().contains("workdir"));
        assert_eq!(err.exit_code(), 1);
        let calls = sys.calls();
        assert!(!calls.iter().any(|c| matches!(
            c,
            Call::LookupUser(_) | Call::SetGid(_) | Call::SetUid(_) | Call::Exec(..)
        )));
    }

    #[test]
    fn bad_gateway_aborts_before_workdir() {
        let sys = ready_syscall();
        let options = BootstrapOptions {
            gateway: Some("gateway".into()),
            ..full_options()
        };

        assert!(Bootstrap::new(&sys, options).run(&argv(&["cat"])).is_err());
        assert!(!sys.calls().iter().any(|c| matches!(c, Call::Chdir(_))));
    }

    #[test]
    fn program_is_resolved_with_the_reset_path() {
        let mut sys = ready_syscall();
        sys.env
            .borrow_mut()
            .insert("PATH".into(), "/launcher/only".into());
        sys.executables.insert(PathBuf::from("/launcher/only/cat"));

        let _ = Bootstrap::new(&sys, BootstrapOptions::default()).run(&argv(&["cat"]));

        assert!(sys
            .calls()
            .contains(&Call::Exec(PathBuf::from("/bin/cat"), argv(&["cat"]))));
    }
}
