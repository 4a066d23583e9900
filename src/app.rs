//! Torrkit application.
//!
//! The application is a thin container: it takes a loaded
//! [`Configuration`](crate::config::Configuration) and starts the jobs
//! it describes. Today that is one job, the uTP listener; peer sessions
//! obtain their byte streams from the multiplexer it returns.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bootstrap::jobs::utp_listener;
use crate::config::Configuration;
use crate::transport::utp::{Error, UtpSocketMux};

/// It starts the application services.
///
/// # Errors
///
/// Will return an error if the uTP listener can't bind its socket.
pub async fn start(
    config: &Configuration,
    bind_address: SocketAddr,
) -> Result<(Arc<UtpSocketMux>, Vec<JoinHandle<()>>), Error> {
    let mut jobs: Vec<JoinHandle<()>> = Vec::new();

    let (mux, listener_job) = utp_listener::start_job(bind_address, config.transport.clone()).await?;
    jobs.push(listener_job);

    Ok((mux, jobs))
}

#[cfg(test)]
mod tests {
    use super::start;
    use crate::config::Configuration;

    #[tokio::test]
    async fn it_should_start_the_utp_listener_job() {
        let configuration = Configuration::default();

        let (mux, jobs) = start(&configuration, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(mux.statistics().active_connections, 0);

        for job in jobs {
            job.abort();
        }
    }
}
