// Popup host for native apps: system browser plus a loopback listener
use super::popup::{PopupHost, PopupWindow};
use crate::error::{AuthError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

const LANDING_PAGE: &str = "<!DOCTYPE html><html><body>\
<h2>All done</h2><p>You can close this window and return to the terminal.</p>\
</body></html>";

/// Connections that send no request line within this window are dropped
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the sign-in page in the system browser and treats requests reaching
/// the redirect URI's loopback port as the popup's location
pub struct LoopbackPopupHost {
    redirect_uri: Url,
    open_browser: bool,
}

impl LoopbackPopupHost {
    pub fn new(redirect_uri: Url, open_browser: bool) -> Self {
        Self {
            redirect_uri,
            open_browser,
        }
    }
}

/// The address the provider sends the browser back to, as named by the request
fn return_address(url: &Url) -> Option<Url> {
    url.query_pairs()
        .find(|(key, _)| key == "redirect_uri" || key == "post_logout_redirect_uri")
        .and_then(|(_, value)| Url::parse(&value).ok())
}

impl PopupHost for LoopbackPopupHost {
    fn open(&self, url: &Url) -> Result<Box<dyn PopupWindow>> {
        let returns_to = return_address(url).unwrap_or_else(|| self.redirect_uri.clone());
        let window = LoopbackWindow::bind(&returns_to)?;

        eprintln!("\n=== Sign in ===");
        if self.open_browser {
            eprintln!("Opening browser to: {}", url);
            eprintln!("\nIf browser doesn't open automatically, visit:");
            eprintln!("  {}\n", url);
            if let Err(e) = webbrowser::open(url.as_str()) {
                eprintln!("Could not open browser automatically: {}", e);
                eprintln!("Please open the URL manually.\n");
            }
        } else {
            eprintln!("Open this URL in a browser to continue:");
            eprintln!("  {}\n", url);
        }
        eprintln!("Waiting for the browser to return to {} ...", returns_to);

        Ok(Box::new(window))
    }
}

/// A listener task accepting connections on the redirect URI's port. Every
/// request it serves becomes a location the popup monitor can read without
/// blocking.
pub(crate) struct LoopbackWindow {
    server: Option<JoinHandle<()>>,
    landings: mpsc::UnboundedReceiver<Url>,
    local_addr: SocketAddr,
}

impl LoopbackWindow {
    /// Must be called from within a tokio runtime
    pub(crate) fn bind(redirect_uri: &Url) -> Result<Self> {
        if redirect_uri.scheme() != "http" {
            return Err(AuthError::Configuration(format!(
                "loopback sign-in needs an http redirect_uri (got {})",
                redirect_uri
            )));
        }
        let host = match redirect_uri.host_str() {
            Some("localhost") | Some("127.0.0.1") => "127.0.0.1",
            Some("[::1]") => "[::1]",
            _ => {
                return Err(AuthError::Configuration(format!(
                    "loopback sign-in needs a localhost redirect_uri (got {})",
                    redirect_uri
                )))
            }
        };
        let port = redirect_uri.port_or_known_default().unwrap_or(80);

        let listener = std::net::TcpListener::bind(format!("{}:{}", host, port))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        tracing::debug!("Listening for the redirect on {}", local_addr);

        let (sender, landings) = mpsc::unbounded_channel();
        let server = tokio::spawn(accept_loop(listener, redirect_uri.clone(), sender));

        Ok(Self {
            server: Some(server),
            landings,
            local_addr,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(listener: TcpListener, redirect_uri: Url, landings: mpsc::UnboundedSender<Url>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Loopback listener error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        // each connection on its own task so an idle preconnect cannot hold up the redirect
        let redirect_uri = redirect_uri.clone();
        let landings = landings.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(REQUEST_TIMEOUT, serve(stream, &redirect_uri)).await {
                Ok(Ok(Some(location))) => {
                    let _ = landings.send(location);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::warn!("Failed to read loopback request: {}", e),
                Err(_) => tracing::debug!("Dropped idle loopback connection from {}", peer),
            }
        });
    }
}

async fn serve(mut stream: TcpStream, redirect_uri: &Url) -> Result<Option<Url>> {
    let target = {
        let mut reader = BufReader::new(&mut stream);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(None);
        }
        // drain headers so closing the socket does not reset the connection
        let mut header = String::new();
        while reader.read_line(&mut header).await? > 2 {
            header.clear();
        }
        // "GET /path?query HTTP/1.1"
        request_line.split_whitespace().nth(1).map(str::to_string)
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        LANDING_PAGE.len(),
        LANDING_PAGE
    );
    stream.write_all(response.as_bytes()).await?;
    let _ = stream.shutdown().await;

    Ok(target.and_then(|t| redirect_uri.join(&t).ok()))
}

impl PopupWindow for LoopbackWindow {
    fn location(&mut self) -> Option<Url> {
        self.server.as_ref()?;
        self.landings.try_recv().ok()
    }

    fn is_closed(&mut self) -> bool {
        self.server.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn close(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

impl Drop for LoopbackWindow {
    fn drop(&mut self) {
        self.close();
    }
}
