//! The concerto daemon.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use concerto::ServerBuilder;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    // SAFETY: the handler only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

struct Args {
    socket_path: PathBuf,
    capture_socket_path: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    alsa_output: Option<String>,
    alsa_input: Option<String>,
}

fn usage() -> ! {
    eprintln!(
        "usage: concertod [--socket PATH] [--capture-socket PATH] \
         [--config-dir DIR] [--alsa-output DEV] [--alsa-input DEV]"
    );
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut args = Args {
        socket_path: PathBuf::from("/run/concerto/concerto.sock"),
        capture_socket_path: None,
        config_dir: None,
        alsa_output: None,
        alsa_input: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        let value = |it: &mut dyn Iterator<Item = String>| it.next().unwrap_or_else(|| usage());
        match flag.as_str() {
            "--socket" => args.socket_path = value(&mut it).into(),
            "--capture-socket" => args.capture_socket_path = Some(value(&mut it).into()),
            "--config-dir" => args.config_dir = Some(value(&mut it).into()),
            "--alsa-output" => args.alsa_output = Some(value(&mut it)),
            "--alsa-input" => args.alsa_input = Some(value(&mut it)),
            _ => usage(),
        }
    }
    args
}

fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install log subscriber");
    }

    let args = parse_args();
    install_signal_handlers();

    let mut builder = ServerBuilder::default().socket_path(&args.socket_path);
    if let Some(path) = &args.capture_socket_path {
        builder = builder.capture_socket_path(path);
    }
    if let Some(dir) = &args.config_dir {
        builder = builder.config_dir(dir);
    }

    let mut server = match builder.build() {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "failed to start server");
            std::process::exit(1);
        }
    };

    #[cfg(feature = "alsa")]
    register_alsa_devices(&server, &args);
    #[cfg(not(feature = "alsa"))]
    let _ = &args;

    let stop = server.stop_flag();
    std::thread::spawn({
        let stop: Arc<AtomicBool> = stop.clone();
        move || loop {
            if STOP.load(Ordering::Relaxed) {
                stop.store(true, Ordering::Relaxed);
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    });

    info!(socket = %args.socket_path.display(), "concertod up");
    if let Err(err) = server.run() {
        error!(%err, "server terminated");
        std::process::exit(1);
    }
}

#[cfg(feature = "alsa")]
fn register_alsa_devices(server: &concerto::Server, args: &Args) {
    use concerto::{AlsaBackend, Backend, Direction, Node, NodeId, NodeType};

    if let Some(name) = &args.alsa_output {
        let index = server.devlist().add_device(
            name,
            Direction::Output,
            Backend::Alsa(AlsaBackend::new_output(name.clone())),
            vec![Node::new(format!("{name} Speaker"), NodeType::Speaker).plugged(true)],
        );
        if let Err(err) = server
            .devlist()
            .add_active_node(Direction::Output, NodeId::new(index, 0))
        {
            error!(%err, dev = name.as_str(), "failed to activate ALSA output");
        }
    }
    if let Some(name) = &args.alsa_input {
        let index = server.devlist().add_device(
            name,
            Direction::Input,
            Backend::Alsa(AlsaBackend::new_input(name.clone())),
            vec![Node::new(format!("{name} Mic"), NodeType::Mic).plugged(true)],
        );
        if let Err(err) = server
            .devlist()
            .add_active_node(Direction::Input, NodeId::new(index, 0))
        {
            error!(%err, dev = name.as_str(), "failed to activate ALSA input");
        }
    }
}
