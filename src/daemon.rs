use crate::cli::DaemonArgs;
use crate::client::Client;
use crate::filter::Filter;
use crate::wire::serve_connection;
use log::{debug, error, info, warn};
use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pause};
use socket2::{Domain, Protocol, Socket, Type};
use std::error::Error;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
#[cfg(feature = "systemd")]
use std::os::fd::FromRawFd as _;
use std::process::exit;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

static FLAG_SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CHILDREN_CNT: AtomicU16 = AtomicU16::new(0);

extern "C" fn handlerfunc(_signum: c_int) {
    FLAG_SHUTDOWN.store(true, Ordering::Relaxed);
}

extern "C" fn handlerfunc_child(_signum: c_int) {
    // reap every exited child; one SIGCHLD may stand for several
    while let Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) =
        waitpid(Some(Pid::from_raw(-1)), Some(WaitPidFlag::WNOHANG))
    {
        let _ = CHILDREN_CNT.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

fn install_signal_handler(fork_mode: bool) -> nix::Result<()> {
    unsafe {
        let handler = SigHandler::Handler(handlerfunc);
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
        // only the fork mode owns its children; watched filter processes
        // are reaped by the session that spawned them
        if fork_mode {
            let handler = SigHandler::Handler(handlerfunc_child);
            let action = SigAction::new(handler, SaFlags::SA_NOCLDSTOP, SigSet::empty());
            sigaction(Signal::SIGCHLD, &action)?;
        }
    }
    Ok(())
}

// a forked connection handler reaps its own watched children
fn restore_child_signal() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGCHLD, &action) }.map(|_| ())
}

fn bind(address: &str) -> Result<Socket, Box<dyn Error>> {
    let address: SocketAddr = address.parse()?;
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(128)?;
    info!("listening on {address}");
    Ok(socket)
}

fn serve_stream<F: Filter>(client: &Client<F>, stream: &TcpStream) -> Result<(), Box<dyn Error>> {
    let reader = BufReader::new(stream);
    let writer = BufWriter::new(stream);
    serve_connection(client, reader, writer)
}

/// Accepts MTA connections until SIGTERM/SIGINT, serving each one
/// sequentially, in a forked child or in a thread.
pub fn daemon<F: Filter>(client: &Client<F>, args: &DaemonArgs) -> Result<(), Box<dyn Error>> {
    if args.fork_max > 0 && args.threads_max > 0 {
        return Err("--fork and --threads are mutually exclusive".into());
    }

    #[cfg(feature = "systemd")]
    let listen_socket = match systemd::daemon::listen_fds(false)?.iter().next() {
        Some(fd) => {
            info!("using socket passed by systemd");
            unsafe { Socket::from_raw_fd(fd) }
        }
        None => bind(&args.address)?,
    };

    #[cfg(not(feature = "systemd"))]
    let listen_socket = bind(&args.address)?;

    let thread_state: Option<Arc<(Mutex<u16>, Condvar)>> = if args.threads_max > 0 {
        Some(Arc::new((Mutex::new(0), Condvar::new())))
    } else {
        None
    };

    install_signal_handler(args.fork_max > 0)?;
    loop {
        if args.fork_max > 0 {
            while CHILDREN_CNT.load(Ordering::Relaxed) >= args.fork_max {
                pause()
            }
        } else if let Some(ref state) = thread_state {
            let (lock, cvar) = state.as_ref();
            let mut count = lock.lock().unwrap_or_else(PoisonError::into_inner);
            while *count >= args.threads_max {
                count = cvar.wait(count).unwrap_or_else(PoisonError::into_inner);
            }
        }
        match listen_socket.accept() {
            Ok((socket, addr)) => {
                debug!("accepted {:?}", addr.as_socket());
                let stream: TcpStream = socket.into();
                if args.fork_max > 0 {
                    match unsafe { fork() } {
                        Ok(ForkResult::Parent { .. }) => {
                            CHILDREN_CNT.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(ForkResult::Child) => {
                            drop(listen_socket);
                            if let Err(e) = restore_child_signal() {
                                warn!("sigaction: {e}");
                            }
                            match serve_stream(client, &stream) {
                                Ok(_) => exit(0),
                                Err(e) => {
                                    error!("{e}");
                                    exit(1)
                                }
                            }
                        }
                        Err(e) => error!("fork: {e}"),
                    }
                } else if let Some(ref state) = thread_state {
                    let state = state.clone();
                    {
                        let (lock, _) = state.as_ref();
                        *lock.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                    }
                    let client = client.clone();
                    thread::spawn(move || {
                        if let Err(e) = serve_stream(&client, &stream) {
                            error!("thread error: {e}");
                        }
                        let (lock, cvar) = &*state;
                        *lock.lock().unwrap_or_else(PoisonError::into_inner) -= 1;
                        cvar.notify_one();
                    });
                } else if let Err(e) = serve_stream(client, &stream) {
                    error!("{e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
            Err(e) => warn!("accept: {e}"),
        }
        if FLAG_SHUTDOWN.load(Ordering::Relaxed) {
            info!("shutting down");
            break;
        }
    }

    if let Some(ref state) = thread_state {
        let (lock, cvar) = state.as_ref();
        let mut count = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            info!("waiting for {} threads to complete", *count);
            count = cvar
                .wait_timeout(count, Duration::from_secs(1))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    Ok(())
}
