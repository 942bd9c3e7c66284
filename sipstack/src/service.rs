use crate::{
    transport::{IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse},
    Endpoint, Result,
};

/// A trait which provides a way to extend the SIP endpoint functionalities.
///
/// Services see every message the transaction layer did not consume, in
/// registration order. A service takes a message out of the `Option` to
/// stop the remaining services from seeing it.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait SipService: Sync + Send + 'static {
    /// Returns the service name.
    fn name(&self) -> &str;

    /// Called when an inbound SIP request is received.
    async fn on_incoming_request(
        &self,
        endpoint: &Endpoint,
        request: &mut Option<IncomingRequest>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when an inbound SIP response is received.
    async fn on_incoming_response(
        &self,
        endpoint: &Endpoint,
        response: &mut Option<IncomingResponse>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called right before a request is written to the wire. An error
    /// aborts the send.
    async fn on_outgoing_request(
        &self,
        endpoint: &Endpoint,
        request: &mut OutgoingRequest,
    ) -> Result<()> {
        Ok(())
    }

    /// Called right before a response is written to the wire. An error
    /// aborts the send.
    async fn on_outgoing_response(
        &self,
        endpoint: &Endpoint,
        response: &mut OutgoingResponse,
    ) -> Result<()> {
        Ok(())
    }
}
