//! uTP listener job starter.
//!
//! It binds the shared UDP socket, spawns the multiplexer receive loop
//! and hands back the multiplexer (for dialing and accepting) together
//! with the join handle of the loop.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::UtpConfig;
use crate::transport::utp::{Error, UtpSocketMux, UTP_TRANSPORT_LOG_TARGET};

/// It starts the uTP listener on the given address.
///
/// # Errors
///
/// Will return an error if the socket can't be bound to the provided
/// address.
pub async fn start_job(
    bind_address: SocketAddr,
    config: UtpConfig,
) -> Result<(Arc<UtpSocketMux>, JoinHandle<()>), Error> {
    let mux = UtpSocketMux::bind(bind_address, config).await?;
    let join_handle = mux.start();

    info!(target: UTP_TRANSPORT_LOG_TARGET, "Starting on: udp://{}", mux.local_addr());

    Ok((mux, join_handle))
}

#[cfg(test)]
mod tests {
    use super::start_job;
    use crate::config::UtpConfig;

    #[tokio::test]
    async fn it_should_bind_and_start_the_receive_loop() {
        let (mux, join_handle) = start_job("127.0.0.1:0".parse().unwrap(), UtpConfig::default())
            .await
            .unwrap();

        assert_ne!(mux.local_addr().port(), 0);
        assert!(!join_handle.is_finished());

        join_handle.abort();
    }
}
