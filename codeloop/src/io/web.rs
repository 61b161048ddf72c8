//! Browser launch for generated web projects.
//!
//! Once a `web` project outlives its startup window, a background thread
//! waits for one of the configured ports to accept connections and opens
//! the page with the configured launcher.

use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::io::config::WebConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Whether a declared project type is served over HTTP.
pub fn is_web_project(project_type: &str) -> bool {
    project_type.trim().eq_ignore_ascii_case("web")
}

/// First port in `ports` that accepts a TCP connection on `host`.
pub fn find_listening_port(host: &str, ports: &[u16]) -> Option<u16> {
    ports.iter().copied().find(|&port| {
        let Ok(addrs) = (host, port).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok())
    })
}

/// Poll until a configured port accepts connections; returns its URL.
pub fn wait_for_server(config: &WebConfig) -> Option<String> {
    let deadline = Instant::now() + config.wait();
    loop {
        if let Some(port) = find_listening_port(&config.host, &config.ports) {
            return Some(format!("http://{}:{port}", config.host));
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run the browser launcher for `url` and wait for it to hand off.
pub fn open_url(command: &[String], url: &str) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("empty browser command");
    };
    let status = Command::new(program)
        .args(args)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("run {program}"))?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}

/// Open the project's page in the background once it is reachable.
///
/// `on_open` gets the URL before the launcher runs. Nothing happens if the
/// browser is disabled or no port answers within the wait.
pub fn open_when_ready<F>(config: &WebConfig, on_open: F) -> Option<thread::JoinHandle<()>>
where
    F: FnOnce(&str) + Send + 'static,
{
    if !config.open_browser {
        debug!("browser launch disabled");
        return None;
    }
    let config = config.clone();
    Some(thread::spawn(move || {
        let Some(url) = wait_for_server(&config) else {
            warn!(ports = ?config.ports, "no web server answered, not opening a browser");
            return;
        };
        on_open(&url);
        match open_url(&config.browser_command, &url) {
            Ok(()) => info!(%url, "opened browser"),
            Err(err) => warn!(%url, err = %format!("{err:#}"), "could not open browser"),
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::net::TcpListener;
    use std::sync::mpsc;

    use super::*;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn recording_browser(out: &std::path::Path) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("printf '%s' \"$0\" > '{}'", out.display()),
        ]
    }

    #[test]
    fn web_project_type_is_case_insensitive() {
        assert!(is_web_project("Web"));
        assert!(is_web_project(" web "));
        assert!(!is_web_project("python"));
    }

    #[test]
    fn finds_the_first_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let open = listener.local_addr().expect("addr").port();
        let closed = closed_port();

        assert_eq!(find_listening_port("127.0.0.1", &[closed, open]), Some(open));
        assert_eq!(find_listening_port("127.0.0.1", &[closed]), None);
    }

    #[test]
    fn opens_the_page_once_the_server_listens() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("opened.txt");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let config = WebConfig {
            ports: vec![port],
            wait_secs: 5,
            browser_command: recording_browser(&out),
            ..WebConfig::default()
        };
        let (tx, rx) = mpsc::channel();

        let handle = open_when_ready(&config, move |url| {
            let _ = tx.send(url.to_string());
        })
        .expect("enabled");
        handle.join().expect("join");

        let expected = format!("http://127.0.0.1:{port}");
        assert_eq!(rx.recv().expect("notified"), expected);
        assert_eq!(fs::read_to_string(&out).expect("read"), expected);
    }

    #[test]
    fn disabled_or_unreachable_server_opens_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("opened.txt");
        let disabled = WebConfig {
            open_browser: false,
            ..WebConfig::default()
        };
        assert!(open_when_ready(&disabled, |_| {}).is_none());

        let unreachable = WebConfig {
            ports: vec![closed_port()],
            wait_secs: 0,
            browser_command: recording_browser(&out),
            ..WebConfig::default()
        };
        open_when_ready(&unreachable, |_| {})
            .expect("enabled")
            .join()
            .expect("join");
        assert!(!out.exists());
    }

    #[test]
    fn failing_launcher_is_an_error() {
        let err = open_url(&["false".to_string()], "http://127.0.0.1:1").unwrap_err();
        assert!(format!("{err:#}").contains("false exited"));
    }
}
