//! Syscall classification table
//!
//! One row per call number the bridge treats specially, sorted by number.
//! Numbers without a row are forwarded to the host with their arguments
//! untouched.

use super::numbers::*;

/// How a pointer argument is guarded. Both kinds get the same fixed window:
/// the true extent of a structure or buffer is not known generically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    Structure,
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerArg {
    pub index: usize,
    pub kind: GuardKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Forward to the host, rewriting and guarding these arguments
    Forward(&'static [PointerArg]),
    /// `brk`: hand out heap from the bump cursor
    HeapAlloc,
    /// `mmap`: anonymous requests only, served from the heap
    AnonymousMap,
    /// `munmap`: succeeds, frees nothing
    Unmap,
    /// Ends the run
    Terminate,
    /// Signal plumbing the guest never relies on; returns 0
    NoOp,
    /// Atomic compare-and-swap service
    ArchSpecific,
    /// No safe host equivalent; halts the run
    Rejected,
}

#[derive(Debug, Clone, Copy)]
pub struct CallSpec {
    pub number: u64,
    pub name: &'static str,
    pub class: CallClass,
}

macro_rules! structure {
    ($i:expr) => {
        PointerArg { index: $i, kind: GuardKind::Structure }
    };
}

macro_rules! buffer {
    ($i:expr) => {
        PointerArg { index: $i, kind: GuardKind::Buffer }
    };
}

macro_rules! call {
    ($num:ident, $name:expr, $class:expr) => {
        CallSpec { number: $num, name: $name, class: $class }
    };
}

use CallClass::*;

pub static CALLS: &[CallSpec] = &[
    call!(READ, "read", Forward(&[buffer!(1)])),
    call!(WRITE, "write", Forward(&[buffer!(1)])),
    call!(OPEN, "open", Forward(&[structure!(0)])),
    call!(STAT, "stat", Forward(&[structure!(0), structure!(1)])),
    call!(FSTAT, "fstat", Forward(&[structure!(1)])),
    call!(LSTAT, "lstat", Forward(&[structure!(0), structure!(1)])),
    call!(POLL, "poll", Forward(&[structure!(0)])),
    call!(MMAP, "mmap", AnonymousMap),
    call!(MUNMAP, "munmap", Unmap),
    call!(BRK, "brk", HeapAlloc),
    call!(RT_SIGACTION, "rt_sigaction", NoOp),
    call!(RT_SIGPROCMASK, "rt_sigprocmask", NoOp),
    call!(PREAD64, "pread64", Forward(&[buffer!(1)])),
    call!(PWRITE64, "pwrite64", Forward(&[buffer!(1)])),
    call!(READV, "readv", Rejected),
    call!(WRITEV, "writev", Forward(&[structure!(1)])),
    call!(ACCESS, "access", Forward(&[structure!(0)])),
    call!(PIPE, "pipe", Forward(&[structure!(0)])),
    call!(SELECT, "select", Forward(&[structure!(1), structure!(2), structure!(3), structure!(4)])),
    call!(MINCORE, "mincore", Rejected),
    call!(SHMAT, "shmat", Forward(&[structure!(1)])),
    call!(SHMCTL, "shmctl", Rejected),
    call!(NANOSLEEP, "nanosleep", Forward(&[structure!(0), structure!(1)])),
    call!(GETITIMER, "getitimer", Forward(&[structure!(1)])),
    call!(SETITIMER, "setitimer", Forward(&[structure!(1), structure!(2)])),
    call!(SENDFILE, "sendfile", Forward(&[structure!(2)])),
    call!(CONNECT, "connect", Forward(&[structure!(1)])),
    call!(ACCEPT, "accept", Forward(&[structure!(1), structure!(2)])),
    call!(SENDTO, "sendto", Forward(&[buffer!(1), structure!(4)])),
    call!(RECVFROM, "recvfrom", Forward(&[buffer!(1), structure!(4), structure!(5)])),
    call!(SENDMSG, "sendmsg", Forward(&[structure!(1)])),
    call!(RECVMSG, "recvmsg", Forward(&[structure!(1)])),
    call!(BIND, "bind", Forward(&[structure!(1)])),
    call!(GETSOCKNAME, "getsockname", Forward(&[structure!(1), structure!(2)])),
    call!(GETPEERNAME, "getpeername", Forward(&[structure!(1), structure!(2)])),
    call!(SOCKETPAIR, "socketpair", Forward(&[structure!(3)])),
    call!(SETSOCKOPT, "setsockopt", Forward(&[structure!(3)])),
    call!(GETSOCKOPT, "getsockopt", Forward(&[structure!(3), structure!(4)])),
    call!(CLONE, "clone", Rejected),
    call!(EXECVE, "execve", Rejected),
    call!(EXIT, "exit", Terminate),
    call!(WAIT4, "wait4", Rejected),
    call!(UNAME, "uname", Forward(&[structure!(0)])),
    call!(SEMOP, "semop", Forward(&[structure!(1)])),
    call!(SHMDT, "shmdt", Forward(&[structure!(0)])),
    call!(MSGSND, "msgsnd", Forward(&[buffer!(1)])),
    call!(MSGRCV, "msgrcv", Forward(&[buffer!(1)])),
    call!(MSGCTL, "msgctl", Rejected),
    call!(TRUNCATE, "truncate", Forward(&[structure!(0)])),
    call!(GETDENTS, "getdents", Forward(&[buffer!(1)])),
    call!(GETCWD, "getcwd", Forward(&[buffer!(0)])),
    call!(CHDIR, "chdir", Forward(&[structure!(0)])),
    call!(RENAME, "rename", Forward(&[structure!(0), structure!(1)])),
    call!(MKDIR, "mkdir", Forward(&[structure!(0)])),
    call!(RMDIR, "rmdir", Forward(&[structure!(0)])),
    call!(CREAT, "creat", Forward(&[structure!(0)])),
    call!(LINK, "link", Forward(&[structure!(0), structure!(1)])),
    call!(UNLINK, "unlink", Forward(&[structure!(0)])),
    call!(SYMLINK, "symlink", Forward(&[structure!(0), structure!(1)])),
    call!(READLINK, "readlink", Forward(&[structure!(0), buffer!(1)])),
    call!(CHMOD, "chmod", Forward(&[structure!(0)])),
    call!(CHOWN, "chown", Forward(&[structure!(0)])),
    call!(LCHOWN, "lchown", Forward(&[structure!(0)])),
    call!(GETTIMEOFDAY, "gettimeofday", Forward(&[structure!(0), structure!(1)])),
    call!(GETRLIMIT, "getrlimit", Forward(&[structure!(1)])),
    call!(GETRUSAGE, "getrusage", Forward(&[structure!(1)])),
    call!(SYSINFO, "sysinfo", Forward(&[structure!(0)])),
    call!(TIMES, "times", Forward(&[structure!(0)])),
    call!(SYSLOG, "syslog", Forward(&[buffer!(1)])),
    call!(GETGROUPS, "getgroups", Forward(&[structure!(1)])),
    call!(SETGROUPS, "setgroups", Forward(&[structure!(1)])),
    call!(SETRESUID, "setresuid", Forward(&[structure!(0), structure!(1), structure!(2)])),
    call!(GETRESUID, "getresuid", Forward(&[structure!(0), structure!(1), structure!(2)])),
    call!(GETRESGID, "getresgid", Forward(&[structure!(0), structure!(1), structure!(2)])),
    call!(RT_SIGPENDING, "rt_sigpending", NoOp),
    call!(RT_SIGTIMEDWAIT, "rt_sigtimedwait", NoOp),
    call!(RT_SIGQUEUEINFO, "rt_sigqueueinfo", NoOp),
    call!(RT_SIGSUSPEND, "rt_sigsuspend", NoOp),
    call!(SIGALTSTACK, "sigaltstack", NoOp),
    call!(UTIME, "utime", Forward(&[structure!(0), structure!(1)])),
    call!(MKNOD, "mknod", Forward(&[structure!(0)])),
    call!(USTAT, "ustat", Forward(&[structure!(1)])),
    call!(STATFS, "statfs", Forward(&[structure!(0), structure!(1)])),
    call!(FSTATFS, "fstatfs", Forward(&[structure!(1)])),
    call!(SCHED_SETPARAM, "sched_setparam", Forward(&[structure!(1)])),
    call!(SCHED_GETPARAM, "sched_getparam", Forward(&[structure!(1)])),
    call!(SCHED_SETSCHEDULER, "sched_setscheduler", Rejected),
    call!(SCHED_RR_GET_INTERVAL, "sched_rr_get_interval", Forward(&[structure!(1)])),
    call!(MODIFY_LDT, "modify_ldt", Forward(&[structure!(1)])),
    call!(PIVOT_ROOT, "pivot_root", Forward(&[structure!(0), structure!(1)])),
    call!(SYSCTL, "sysctl", Forward(&[structure!(0)])),
    call!(ARCH_PRCTL, "arch_prctl", Rejected),
    call!(ADJTIMEX, "adjtimex", Forward(&[structure!(0)])),
    call!(SETRLIMIT, "setrlimit", Forward(&[structure!(1)])),
    call!(CHROOT, "chroot", Forward(&[structure!(0)])),
    call!(ACCT, "acct", Forward(&[structure!(0)])),
    call!(SETTIMEOFDAY, "settimeofday", Forward(&[structure!(0), structure!(1)])),
    call!(MOUNT, "mount", Rejected),
    call!(UMOUNT2, "umount2", Forward(&[structure!(0)])),
    call!(SWAPON, "swapon", Forward(&[structure!(0)])),
    call!(SWAPOFF, "swapoff", Forward(&[structure!(0)])),
    call!(REBOOT, "reboot", Rejected),
    call!(SETHOSTNAME, "sethostname", Forward(&[structure!(0)])),
    call!(SETDOMAINNAME, "setdomainname", Forward(&[structure!(0)])),
    call!(IOPL, "iopl", Forward(&[structure!(1)])),
    call!(INIT_MODULE, "init_module", Rejected),
    call!(DELETE_MODULE, "delete_module", Forward(&[structure!(0)])),
    call!(QUOTACTL, "quotactl", Rejected),
    call!(SETXATTR, "setxattr", Forward(&[structure!(0), structure!(1), buffer!(2)])),
    call!(LSETXATTR, "lsetxattr", Forward(&[structure!(0), structure!(1), buffer!(2)])),
    call!(FSETXATTR, "fsetxattr", Forward(&[structure!(1), buffer!(2)])),
    call!(GETXATTR, "getxattr", Forward(&[structure!(0), structure!(1), buffer!(2)])),
    call!(LGETXATTR, "lgetxattr", Forward(&[structure!(0), structure!(1), buffer!(2)])),
    call!(FGETXATTR, "fgetxattr", Forward(&[structure!(1), buffer!(2)])),
    call!(LISTXATTR, "listxattr", Forward(&[structure!(0), buffer!(1)])),
    call!(LLISTXATTR, "llistxattr", Forward(&[structure!(0), buffer!(1)])),
    call!(FLISTXATTR, "flistxattr", Forward(&[buffer!(1)])),
    call!(REMOVEXATTR, "removexattr", Forward(&[structure!(0), structure!(1)])),
    call!(LREMOVEXATTR, "lremovexattr", Forward(&[structure!(0), structure!(1)])),
    call!(FREMOVEXATTR, "fremovexattr", Forward(&[structure!(1)])),
    call!(TIME, "time", Forward(&[structure!(0)])),
    call!(FUTEX, "futex", Forward(&[structure!(0), structure!(3), structure!(4)])),
    call!(SCHED_SETAFFINITY, "sched_setaffinity", Rejected),
    call!(SCHED_GETAFFINITY, "sched_getaffinity", Rejected),
    call!(IO_SETUP, "io_setup", Forward(&[structure!(1)])),
    call!(IO_GETEVENTS, "io_getevents", Rejected),
    call!(IO_SUBMIT, "io_submit", Rejected),
    call!(IO_CANCEL, "io_cancel", Forward(&[structure!(1), structure!(2)])),
    call!(GETDENTS64, "getdents64", Forward(&[buffer!(1)])),
    call!(SET_TID_ADDRESS, "set_tid_address", Forward(&[structure!(0)])),
    call!(SEMTIMEDOP, "semtimedop", Rejected),
    call!(TIMER_CREATE, "timer_create", Forward(&[structure!(1), structure!(2)])),
    call!(TIMER_SETTIME, "timer_settime", Rejected),
    call!(TIMER_GETTIME, "timer_gettime", Forward(&[structure!(1)])),
    call!(CLOCK_SETTIME, "clock_settime", Forward(&[structure!(1)])),
    call!(CLOCK_GETTIME, "clock_gettime", Forward(&[structure!(1)])),
    call!(CLOCK_GETRES, "clock_getres", Forward(&[structure!(1)])),
    call!(CLOCK_NANOSLEEP, "clock_nanosleep", Rejected),
    call!(EXIT_GROUP, "exit_group", Terminate),
    call!(EPOLL_WAIT, "epoll_wait", Forward(&[structure!(1)])),
    call!(EPOLL_CTL, "epoll_ctl", Rejected),
    call!(TGKILL, "tgkill", Terminate),
    call!(UTIMES, "utimes", Forward(&[structure!(0), structure!(1)])),
    call!(MBIND, "mbind", Rejected),
    call!(SET_MEMPOLICY, "set_mempolicy", Forward(&[structure!(1)])),
    call!(GET_MEMPOLICY, "get_mempolicy", Forward(&[structure!(0), structure!(1)])),
    call!(MQ_OPEN, "mq_open", Rejected),
    call!(MQ_UNLINK, "mq_unlink", Forward(&[structure!(0)])),
    call!(MQ_TIMEDSEND, "mq_timedsend", Rejected),
    call!(MQ_TIMEDRECEIVE, "mq_timedreceive", Rejected),
    call!(MQ_NOTIFY, "mq_notify", Forward(&[structure!(1)])),
    call!(MQ_GETSETATTR, "mq_getsetattr", Forward(&[structure!(1), structure!(2)])),
    call!(KEXEC_LOAD, "kexec_load", Rejected),
    call!(WAITID, "waitid", Rejected),
    call!(ADD_KEY, "add_key", Forward(&[structure!(0), structure!(1), structure!(2)])),
    call!(REQUEST_KEY, "request_key", Forward(&[structure!(0), structure!(1), structure!(2)])),
    call!(INOTIFY_ADD_WATCH, "inotify_add_watch", Forward(&[structure!(1)])),
    call!(MIGRATE_PAGES, "migrate_pages", Rejected),
    call!(OPENAT, "openat", Forward(&[structure!(1)])),
    call!(MKDIRAT, "mkdirat", Forward(&[structure!(1)])),
    call!(MKNODAT, "mknodat", Forward(&[structure!(1)])),
    call!(FCHOWNAT, "fchownat", Forward(&[structure!(1)])),
    call!(FUTIMESAT, "futimesat", Forward(&[structure!(1), structure!(2)])),
    call!(NEWFSTATAT, "newfstatat", Forward(&[structure!(1), structure!(2)])),
    call!(UNLINKAT, "unlinkat", Forward(&[structure!(1)])),
    call!(RENAMEAT, "renameat", Forward(&[structure!(1), structure!(3)])),
    call!(LINKAT, "linkat", Forward(&[structure!(1), structure!(3)])),
    call!(SYMLINKAT, "symlinkat", Forward(&[structure!(0), structure!(2)])),
    call!(READLINKAT, "readlinkat", Forward(&[structure!(1), buffer!(2)])),
    call!(FCHMODAT, "fchmodat", Forward(&[structure!(1)])),
    call!(FACCESSAT, "faccessat", Forward(&[structure!(1)])),
    call!(PSELECT6, "pselect6", Rejected),
    call!(PPOLL, "ppoll", Rejected),
    call!(SET_ROBUST_LIST, "set_robust_list", Forward(&[structure!(0)])),
    call!(GET_ROBUST_LIST, "get_robust_list", Rejected),
    call!(SPLICE, "splice", Rejected),
    call!(VMSPLICE, "vmsplice", Forward(&[buffer!(1)])),
    call!(MOVE_PAGES, "move_pages", Rejected),
    call!(UTIMENSAT, "utimensat", Forward(&[structure!(1), structure!(2)])),
    call!(EPOLL_PWAIT, "epoll_pwait", Rejected),
    call!(SIGNALFD, "signalfd", NoOp),
    call!(TIMERFD_SETTIME, "timerfd_settime", Rejected),
    call!(TIMERFD_GETTIME, "timerfd_gettime", Forward(&[structure!(1)])),
    call!(ACCEPT4, "accept4", Forward(&[structure!(1), structure!(2)])),
    call!(SIGNALFD4, "signalfd4", NoOp),
    call!(PIPE2, "pipe2", Forward(&[structure!(0)])),
    call!(PREADV, "preadv", Rejected),
    call!(PWRITEV, "pwritev", Rejected),
    call!(RT_TGSIGQUEUEINFO, "rt_tgsigqueueinfo", NoOp),
    call!(PERF_EVENT_OPEN, "perf_event_open", Forward(&[structure!(0)])),
    call!(RECVMMSG, "recvmmsg", Forward(&[structure!(1), structure!(4)])),
    call!(PRLIMIT64, "prlimit64", Rejected),
    call!(NAME_TO_HANDLE_AT, "name_to_handle_at", Rejected),
    call!(OPEN_BY_HANDLE_AT, "open_by_handle_at", Rejected),
    call!(CLOCK_ADJTIME, "clock_adjtime", Forward(&[structure!(1)])),
    call!(SENDMMSG, "sendmmsg", Forward(&[structure!(1)])),
    call!(GETCPU, "getcpu", Forward(&[structure!(0), structure!(1), structure!(2)])),
    call!(PROCESS_VM_READV, "process_vm_readv", Rejected),
    call!(PROCESS_VM_WRITEV, "process_vm_writev", Rejected),
    call!(FINIT_MODULE, "finit_module", Forward(&[structure!(1)])),
    call!(SCHED_SETATTR, "sched_setattr", Forward(&[structure!(1)])),
    call!(SCHED_GETATTR, "sched_getattr", Forward(&[structure!(1)])),
    call!(RENAMEAT2, "renameat2", Rejected),
    call!(SECCOMP, "seccomp", Rejected),
    call!(GETRANDOM, "getrandom", Forward(&[buffer!(0)])),
    call!(MEMFD_CREATE, "memfd_create", Forward(&[structure!(0)])),
    call!(KEXEC_FILE_LOAD, "kexec_file_load", Rejected),
    call!(BPF, "bpf", Forward(&[structure!(1)])),
    call!(ARCH_SPECIFIC_SYSCALL, "arch_specific_syscall", ArchSpecific),
];

pub fn lookup(number: u64) -> Option<&'static CallSpec> {
    CALLS
        .binary_search_by_key(&number, |c| c.number)
        .ok()
        .map(|i| &CALLS[i])
}

/// Name for diagnostics; unknown numbers have none
pub fn name_of(number: u64) -> &'static str {
    lookup(number).map_or("unknown", |c| c.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sorted_and_unique() {
        for pair in CALLS.windows(2) {
            assert!(pair[0].number < pair[1].number, "{} before {}", pair[0].name, pair[1].name);
        }
    }

    #[test]
    fn test_pointer_positions() {
        assert_eq!(lookup(READ).unwrap().class, Forward(&[buffer!(1)]));
        assert_eq!(lookup(OPEN).unwrap().class, Forward(&[structure!(0)]));
        match lookup(FUTEX).unwrap().class {
            Forward(args) => assert_eq!(args.iter().map(|a| a.index).collect::<Vec<_>>(), vec![0, 3, 4]),
            other => panic!("futex classified as {:?}", other),
        }
        match lookup(SELECT).unwrap().class {
            Forward(args) => assert_eq!(args.len(), 4),
            other => panic!("select classified as {:?}", other),
        }
    }

    #[test]
    fn test_special_classes() {
        assert_eq!(lookup(BRK).unwrap().class, HeapAlloc);
        assert_eq!(lookup(MMAP).unwrap().class, AnonymousMap);
        assert_eq!(lookup(MUNMAP).unwrap().class, Unmap);
        for n in [EXIT, EXIT_GROUP, TGKILL] {
            assert_eq!(lookup(n).unwrap().class, Terminate);
        }
        for n in [CLONE, EXECVE, READV, WAIT4, PPOLL] {
            assert_eq!(lookup(n).unwrap().class, Rejected);
        }
        assert_eq!(lookup(RT_SIGACTION).unwrap().class, NoOp);
        assert_eq!(lookup(ARCH_SPECIFIC_SYSCALL).unwrap().class, ArchSpecific);
    }

    #[test]
    fn test_unlisted_numbers() {
        // lseek and getpid carry no pointers
        assert!(lookup(8).is_none());
        assert!(lookup(39).is_none());
        assert_eq!(name_of(39), "unknown");
        assert_eq!(name_of(CLONE), "clone");
    }
}
