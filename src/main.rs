use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match tm_control::server::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("tm-control failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
