//! 子プロセスの起動: `posix_spawnp` に渡す属性・fd 操作・argv の組み立て。
//!
//! 子側で必要な処理（stdin/stdout の付け替え、SIGINT/SIGTSTP の `SIG_DFL` 化、exec）は
//! spawn 前にすべて [`Launch`] に積んでおく。子側の結果は
//! 「プログラムイメージの置き換えに成功」か「spawn がエラーを返す」のどちらかしかない。

use std::ffi::{CString, NulError};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::ptr;

use libc::{c_char, c_int, pid_t};
use thiserror::Error;

/// 段を起動できなかった理由。
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("{command}: command not found")]
    NotFound { command: String },
    #[error("{command}: permission denied")]
    PermissionDenied { command: String },
    #[error("{command}: {source}")]
    Os { command: String, source: io::Error },
    #[error("{command}: argument contains a NUL byte")]
    NulByte { command: String },
}

impl SpawnError {
    fn from_errno(errno: c_int, command: &str) -> Self {
        let command = command.to_string();
        match errno {
            libc::ENOENT => Self::NotFound { command },
            libc::EACCES => Self::PermissionDenied { command },
            _ => Self::Os {
                command,
                source: io::Error::from_raw_os_error(errno),
            },
        }
    }

    /// 子が exec に失敗した場合に相当する終了ステータス。
    /// 127 = command not found, 126 = permission denied, 1 = その他。
    pub fn exit_status(&self) -> i32 {
        match self {
            Self::NotFound { .. } => 127,
            Self::PermissionDenied { .. } => 126,
            Self::Os { .. } | Self::NulByte { .. } => 1,
        }
    }
}

/// シェル自身は無視し、子では `SIG_DFL` に戻すシグナル。
pub const JOB_SIGNALS: [(c_int, &str); 2] =
    [(libc::SIGINT, "SIGINT"), (libc::SIGTSTP, "SIGTSTP")];

/// `posix_spawn*` 系の戻り値（0 か errno）を `io::Result` に変換する。
fn check(ret: c_int) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// spawn 1 回分の属性とファイルアクション。Drop で両方 destroy する。
struct Launch {
    attr: libc::posix_spawnattr_t,
    actions: libc::posix_spawn_file_actions_t,
}

impl Launch {
    fn new() -> io::Result<Self> {
        let mut attr = MaybeUninit::<libc::posix_spawnattr_t>::uninit();
        check(unsafe { libc::posix_spawnattr_init(attr.as_mut_ptr()) })?;
        let mut actions = MaybeUninit::<libc::posix_spawn_file_actions_t>::uninit();
        let ret = unsafe { libc::posix_spawn_file_actions_init(actions.as_mut_ptr()) };
        if let Err(e) = check(ret) {
            unsafe { libc::posix_spawnattr_destroy(attr.as_mut_ptr()) };
            return Err(e);
        }
        Ok(unsafe {
            Self {
                attr: attr.assume_init(),
                actions: actions.assume_init(),
            }
        })
    }

    /// シェルが無視している SIGINT/SIGTSTP を子で `SIG_DFL` に戻す。
    /// SIGCHLD の配送先は signal_hook のハンドラなので exec で自動的にデフォルトになる。
    fn reset_job_signals(&mut self) -> io::Result<()> {
        unsafe {
            let mut set = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(set.as_mut_ptr());
            let mut set = set.assume_init();
            for (sig, _) in JOB_SIGNALS {
                libc::sigaddset(&mut set, sig);
            }
            check(libc::posix_spawnattr_setsigdefault(&mut self.attr, &set))?;
            check(libc::posix_spawnattr_setflags(
                &mut self.attr,
                libc::POSIX_SPAWN_SETSIGDEF as libc::c_short,
            ))
        }
    }

    /// 親の `from` を子の `to` に dup2 する。`from` は `O_CLOEXEC` 付きなので exec 時に閉じる。
    fn redirect(&mut self, from: RawFd, to: RawFd) -> io::Result<()> {
        check(unsafe { libc::posix_spawn_file_actions_adddup2(&mut self.actions, from, to) })
    }
}

impl Drop for Launch {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.actions);
            libc::posix_spawnattr_destroy(&mut self.attr);
        }
    }
}

/// NULL 終端の argv。`ptrs` は `args` の各要素を指す。
struct Argv {
    args: Vec<CString>,
    ptrs: Vec<*mut c_char>,
}

impl Argv {
    fn new(args: &[&str]) -> Result<Self, NulError> {
        let args = args
            .iter()
            .map(|a| CString::new(*a))
            .collect::<Result<Vec<_>, _>>()?;
        let ptrs = args
            .iter()
            .map(|a| a.as_ptr() as *mut c_char)
            .chain([ptr::null_mut()])
            .collect();
        Ok(Self { args, ptrs })
    }
}

extern "C" {
    static environ: *const *mut c_char;
}

/// `args[0]` を PATH 検索して起動し、子の PID を返す。
///
/// `stdin_fd` / `stdout_fd` が `Some` なら子の fd 0 / 1 に付け替える。`None` は継承。
/// 環境変数はそのまま継承する。
pub fn spawn(
    args: &[&str],
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
) -> Result<pid_t, SpawnError> {
    let Some(&command) = args.first() else {
        return Err(SpawnError::from_errno(libc::ENOENT, ""));
    };
    let argv = Argv::new(args).map_err(|_| SpawnError::NulByte {
        command: command.to_string(),
    })?;
    let os_error = |source| SpawnError::Os {
        command: command.to_string(),
        source,
    };

    let mut launch = Launch::new().map_err(os_error)?;
    launch.reset_job_signals().map_err(os_error)?;
    for (fd, target) in [(stdin_fd, libc::STDIN_FILENO), (stdout_fd, libc::STDOUT_FILENO)] {
        if let Some(fd) = fd {
            launch.redirect(fd, target).map_err(os_error)?;
        }
    }

    let mut pid: pid_t = 0;
    let ret = unsafe {
        libc::posix_spawnp(
            &mut pid,
            argv.args[0].as_ptr(),
            &launch.actions,
            &launch.attr,
            argv.ptrs.as_ptr(),
            environ,
        )
    };
    if ret != 0 {
        return Err(SpawnError::from_errno(ret, command));
    }
    Ok(pid)
}
