//! Test transport: hands the server half of every link to the test.

use async_trait::async_trait;
use rdao_core::{Connector, Link, TransportError};
use tokio::sync::mpsc;

pub(crate) struct TestConnector {
    pub(crate) links: mpsc::UnboundedSender<Link>,
}

impl TestConnector {
    pub(crate) fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<Link>) {
        let (links, accepted) = mpsc::unbounded_channel();
        (std::sync::Arc::new(Self { links }), accepted)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (client, server) = Link::pair();
        self.links.send(server).map_err(|_| TransportError::Closed)?;
        Ok(client)
    }
}
