//! Deliveries to peer nyms and contract publication

use tracing::debug;

use super::{delivered, HandlerResult, Worker};
use crate::error::{Precondition, TaskError};
use crate::operation::OperationRequest;
use crate::storage::PeerBox;
use crate::types::{NymId, Payment, PeerReply, PeerRequest, Purse, ServerId};

impl Worker {
    pub(super) async fn send_message(&self, recipient: &NymId, body: &str) -> HandlerResult {
        self.ensure_nym(recipient).await?;
        let reply = self
            .run(OperationRequest::SendMessage {
                recipient: recipient.clone(),
                body: body.to_string(),
            })
            .await?;
        debug!(context = %self.context, %recipient, "Message sent");
        Ok(delivered(reply))
    }

    pub(super) async fn convey_payment(&self, recipient: &NymId, payment: &Payment) -> HandlerResult {
        self.ensure_nym(recipient).await?;
        let reply = self
            .run(OperationRequest::ConveyPayment {
                recipient: recipient.clone(),
                payment: payment.clone(),
            })
            .await?;
        debug!(context = %self.context, %recipient, payment = %payment.id, "Payment conveyed");
        Ok(delivered(reply))
    }

    pub(super) async fn send_cash(&self, recipient: &NymId, purse: &Purse) -> HandlerResult {
        self.ensure_nym(recipient).await?;
        let reply = self
            .run(OperationRequest::SendCash {
                recipient: recipient.clone(),
                purse: purse.clone(),
            })
            .await?;
        debug!(context = %self.context, %recipient, amount = purse.amount, "Cash sent");
        Ok(delivered(reply))
    }

    pub(super) async fn publish_server_contract(&self, server: &ServerId) -> HandlerResult {
        let Some(contract) = self.repository.server_contract(server) else {
            return Err(TaskError::Missing(Precondition::UnknownServer(
                server.clone(),
            )));
        };
        self.run(OperationRequest::PublishServerContract { contract })
            .await?;
        debug!(context = %self.context, %server, "Server contract published");
        Ok(None)
    }

    pub(super) async fn peer_request(&self, target: &NymId, request: &PeerRequest) -> HandlerResult {
        self.ensure_nym(target).await?;
        let reply = self
            .run(OperationRequest::PeerRequest {
                target: target.clone(),
                request: request.clone(),
            })
            .await?;
        self.repository
            .store_peer_request(&self.context.nym, PeerBox::Sent, request.clone());
        Ok(delivered(reply))
    }

    /// Answer a received request and file it as processed
    pub(super) async fn peer_reply(
        &self,
        target: &NymId,
        reply: &PeerReply,
        request: &PeerRequest,
    ) -> HandlerResult {
        self.ensure_nym(target).await?;
        let sent = self
            .run(OperationRequest::PeerReply {
                target: target.clone(),
                reply: reply.clone(),
                request: request.clone(),
            })
            .await?;

        let nym = &self.context.nym;
        self.repository
            .store_peer_reply(nym, PeerBox::Sent, reply.clone());
        if !self
            .repository
            .move_peer_request(nym, &request.id, PeerBox::Incoming, PeerBox::Processed)
        {
            self.repository
                .store_peer_request(nym, PeerBox::Processed, request.clone());
        }
        Ok(delivered(sent))
    }
}
