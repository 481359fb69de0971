mod cli;
mod log_service;

#[tokio::main]
async fn main() {
    let code = cli::run().await;
    std::process::exit(code);
}
