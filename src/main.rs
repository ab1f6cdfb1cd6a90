mod ai;
mod app;
mod engine;
mod error;
mod handover;
mod intro;
mod kb;
mod persist;
mod prompting;
mod routing;
mod sweeper;
mod types;
mod whatsapp;

#[tokio::main]
async fn main() {
    app::run().await;
}
