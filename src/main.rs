use ember::http::request::Request;
use ember::http::response::{Response, StatusCode};
use ember::websocket::{Message, WebSocket};
use ember::{Config, Router, Server};
use tracing_subscriber::EnvFilter;

async fn hello(req: Request) -> anyhow::Result<Response> {
    let name = req.query.get("name").unwrap_or("world");
    Ok(Response::text(StatusCode::Ok, format!("Hello, {name}!\n")))
}

async fn echo(_req: Request, mut ws: WebSocket) -> anyhow::Result<()> {
    while let Some(message) = ws.recv().await? {
        match message {
            Message::Text(_) | Message::Binary(_) => ws.send(message).await?,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::load()?;

    let mut router = Router::new();
    router.get("/", hello)?.websocket("/ws", echo)?;

    let server = Server::new(cfg, router).start().await?;
    for addr in server.local_addrs() {
        tracing::info!("Serving on http://{}", addr);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.shutdown().await;

    Ok(())
}
