//! The chat service: lifecycle plus every operation of the RPC surface.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use lnchat_node::LnNode;
use lnchat_shared::ln::{ChannelPoint, OpenChannelRequest, SelfBalance, SelfInfo};
use lnchat_shared::{Address, ChatError, MessageOptions, Node, PageOptions, Result};
use lnchat_store::{
    participants_key, Contact, Discussion, DiscussionStatistics, Invoice, Message, Store,
    StoreError,
};

use crate::pump::{self, PaymentWaiters};
use crate::send::{self, SendOutcome, SendRequest};
use crate::subscribers::{Subscribers, Subscription};

/// State shared by the RPC handlers, the event loops and the send flows.
pub(crate) struct Core {
    pub node: Arc<dyn LnNode>,
    pub store: Store,
    pub self_address: Address,
    pub subscribers: Subscribers,
    pub waiters: PaymentWaiters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: String,
}

pub struct ChatService {
    core: Arc<Core>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Map a store "not found" onto a more specific error.
fn or_not_found(err: StoreError, not_found: impl FnOnce() -> ChatError) -> ChatError {
    match err {
        StoreError::NotFound(_) => not_found(),
        other => other.into(),
    }
}

impl ChatService {
    /// Open the store at `db_path` and start following `node`.
    pub async fn start(node: Arc<dyn LnNode>, db_path: &Path) -> Result<Self> {
        let store = Store::open(db_path)?;
        Self::start_with_store(node, store).await
    }

    /// Start on an already open store. Returns once both event streams are
    /// subscribed and caught up.
    pub async fn start_with_store(node: Arc<dyn LnNode>, store: Store) -> Result<Self> {
        let self_info = node.get_self_info().await?;
        info!(address = %self_info.address, alias = %self_info.alias, "starting chat service");

        let core = Arc::new(Core {
            node,
            store,
            self_address: self_info.address,
            subscribers: Subscribers::new(),
            waiters: PaymentWaiters::default(),
        });

        let invoices = pump::subscribe_invoices(&core).await?;
        let payments = pump::subscribe_payments(&core).await?;

        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(pump::run_invoice_loop(
                core.clone(),
                invoices,
                shutdown.subscribe(),
            )),
            tokio::spawn(pump::run_payment_loop(
                core.clone(),
                payments,
                shutdown.subscribe(),
            )),
        ];

        Ok(Self {
            core,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Stop the event loops, drop subscribers and close the store.
    pub async fn cleanup(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "event loop panicked");
            }
        }
        self.core.subscribers.clear();
        self.core.store.close();
        info!("chat service stopped");
    }

    pub fn self_address(&self) -> &Address {
        &self.core.self_address
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    // ------------------------------------------------------------------
    // NodeInfo
    // ------------------------------------------------------------------

    pub fn get_version(&self) -> Version {
        Version {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn get_self_info(&self) -> Result<SelfInfo> {
        self.core.node.get_self_info().await
    }

    pub async fn get_self_balance(&self) -> Result<SelfBalance> {
        self.core.node.get_self_balance().await
    }

    pub async fn get_nodes(&self) -> Result<Vec<Node>> {
        self.core.node.get_nodes().await
    }

    pub async fn search_node_by_address(&self, address: &Address) -> Result<Node> {
        self.get_nodes()
            .await?
            .into_iter()
            .find(|n| &n.address == address)
            .ok_or_else(|| ChatError::not_found(format!("node {address} not found")))
    }

    /// Nodes whose alias is exactly `alias`.
    pub async fn search_node_by_alias(&self, alias: &str) -> Result<Vec<Node>> {
        Ok(self
            .get_nodes()
            .await?
            .into_iter()
            .filter(|n| n.alias == alias)
            .collect())
    }

    pub async fn connect_node(&self, address: &Address, host_port: &str) -> Result<()> {
        if host_port.is_empty() {
            return Err(ChatError::invalid_argument("host:port is required"));
        }
        self.core.node.connect_node(address, host_port).await
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    pub fn add_contact(&self, display_name: &str, node: &Node) -> Result<Contact> {
        let id = self
            .core
            .store
            .with(|db| db.insert_contact(display_name, node))
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => ChatError::contact_already_exists(&node.address),
                other => other.into(),
            })?;
        info!(contact_id = id, address = %node.address.short(), "contact added");
        self.get_contact(id)
    }

    pub fn get_contact(&self, id: u64) -> Result<Contact> {
        self.core
            .store
            .with(|db| db.get_contact(id))
            .map_err(|e| or_not_found(e, || ChatError::contact_not_found(id)))
    }

    pub fn get_contacts(&self, page: &PageOptions) -> Result<Vec<Contact>> {
        Ok(self.core.store.with(|db| db.list_contacts(page))?)
    }

    pub fn remove_contact_by_id(&self, id: u64) -> Result<()> {
        self.core
            .store
            .with(|db| db.delete_contact(id))
            .map_err(|e| or_not_found(e, || ChatError::contact_not_found(id)))
    }

    pub fn remove_contact_by_address(&self, address: &Address) -> Result<()> {
        self.core
            .store
            .with(|db| db.delete_contact_by_address(address))
            .map_err(|e| or_not_found(e, || ChatError::contact_not_found(address)))
    }

    // ------------------------------------------------------------------
    // Discussions
    // ------------------------------------------------------------------

    pub fn get_discussions(&self, page: &PageOptions) -> Result<Vec<Discussion>> {
        Ok(self.core.store.with(|db| db.list_discussions(page))?)
    }

    pub fn get_discussion(&self, id: u64) -> Result<Discussion> {
        self.core
            .store
            .with(|db| db.get_discussion(id))
            .map_err(|e| or_not_found(e, || ChatError::discussion_not_found(id)))
    }

    /// Messages of a discussion, oldest first unless `page.reverse`.
    pub fn get_history(&self, id: u64, page: &PageOptions) -> Result<Vec<Message>> {
        self.core.store.with(|db| {
            db.get_discussion(id)
                .map_err(|e| or_not_found(e, || ChatError::discussion_not_found(id)))?;
            Ok(db.list_messages_for_discussion(id, page)?)
        })
    }

    pub fn get_statistics(&self, id: u64) -> Result<DiscussionStatistics> {
        self.core
            .store
            .with(|db| db.discussion_statistics(id, &self.core.self_address))
            .map_err(|e| or_not_found(e, || ChatError::discussion_not_found(id)))
    }

    /// Create a discussion. Anonymous discussions are 1-on-1 only.
    pub fn add_discussion(
        &self,
        participants: &[Address],
        options: &MessageOptions,
    ) -> Result<Discussion> {
        if participants.is_empty() {
            return Err(ChatError::invalid_argument(
                "a discussion needs at least one participant",
            ));
        }
        if options.anonymous && participants.len() > 1 {
            return Err(ChatError::invalid_argument(
                "anonymous discussions cannot have more than one participant",
            ));
        }
        if options.fee_limit_msat < 0 {
            return Err(ChatError::invalid_argument("fee limit cannot be negative"));
        }

        let discussion = self
            .core
            .store
            .with(|db| db.insert_discussion(participants, options))
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => {
                    ChatError::discussion_already_exists(participants_key(participants))
                }
                other => other.into(),
            })?;
        info!(discussion_id = discussion.id, "discussion added");
        Ok(discussion)
    }

    pub fn update_last_read(&self, id: u64, message_id: u64) -> Result<()> {
        self.core
            .store
            .with(|db| db.update_last_read(id, message_id))
            .map_err(|e| match e {
                StoreError::NotFound(what) if what.starts_with("discussion") => {
                    ChatError::discussion_not_found(id)
                }
                other => other.into(),
            })
    }

    /// Delete a discussion with its messages.
    pub fn remove_discussion(&self, id: u64) -> Result<()> {
        self.core
            .store
            .with(|db| db.delete_discussion(id))
            .map_err(|e| or_not_found(e, || ChatError::discussion_not_found(id)))?;
        info!(discussion_id = id, "discussion removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn estimate_message(&self, request: &SendRequest) -> Result<Message> {
        send::estimate(&self.core, request).await
    }

    pub async fn send_message(&self, request: &SendRequest) -> Result<SendOutcome> {
        send::send(&self.core, request).await
    }

    /// Receive every incoming message materialised from now on.
    pub fn subscribe_messages(&self) -> Subscription {
        self.core.subscribers.subscribe()
    }

    pub fn unsubscribe_messages(&self, id: u64) {
        self.core.subscribers.unsubscribe(id);
    }

    // ------------------------------------------------------------------
    // Payments & channels
    // ------------------------------------------------------------------

    pub async fn create_invoice(
        &self,
        memo: &str,
        amt_msat: i64,
        expiry: i64,
        private: bool,
    ) -> Result<Invoice> {
        if amt_msat < 0 || expiry < 0 {
            return Err(ChatError::invalid_argument(
                "amount and expiry cannot be negative",
            ));
        }
        let invoice = self
            .core
            .node
            .create_invoice(memo, amt_msat, expiry, private)
            .await?;
        Ok(self
            .core
            .store
            .with(|db| db.upsert_invoice(&self.core.self_address, &invoice))?)
    }

    pub async fn lookup_invoice(&self, pay_req: &str) -> Result<Invoice> {
        if pay_req.is_empty() {
            return Err(ChatError::invalid_argument("payment request is required"));
        }
        let invoice = self.core.node.lookup_invoice(pay_req).await?;
        Ok(self
            .core
            .store
            .with(|db| db.upsert_invoice(&self.core.self_address, &invoice))?)
    }

    pub async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint> {
        if request.amt_msat <= 0 {
            return Err(ChatError::invalid_argument("channel amount must be positive"));
        }
        if request.push_msat < 0 || request.push_msat > request.amt_msat {
            return Err(ChatError::invalid_argument(
                "push amount must be between 0 and the channel amount",
            ));
        }
        let point = self.core.node.open_channel(request).await?;
        info!(txid = %point.funding_txid, output = point.output_index, "channel opening");
        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lnchat_node::{SimNetwork, SimNode};
    use lnchat_shared::ln::{FailureReason, PaymentStatus};
    use lnchat_shared::ErrorKind;

    struct Peer {
        sim: SimNode,
        service: ChatService,
        _dir: tempfile::TempDir,
    }

    async fn peer(network: &SimNetwork, alias: &str) -> Peer {
        let sim = network.add_node(alias);
        let dir = tempfile::tempdir().unwrap();
        let service = ChatService::start(Arc::new(sim.clone()), &dir.path().join("lnchat.db"))
            .await
            .unwrap();
        Peer {
            sim,
            service,
            _dir: dir,
        }
    }

    async fn next_message(sub: &mut Subscription) -> Message {
        tokio::time::timeout(Duration::from_secs(5), sub.receiver.recv())
            .await
            .expect("message in time")
            .expect("subscription open")
    }

    fn text(payload: &str, discussion_id: u64) -> SendRequest {
        SendRequest {
            payload: payload.into(),
            amt_msat: 1_000,
            discussion_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_keysend_message_reaches_peer() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        let mut inbox = bob.service.subscribe_messages();

        let discussion = alice
            .service
            .add_discussion(&[bob.sim.address()], &MessageOptions::default())
            .unwrap();
        let outcome = alice
            .service
            .send_message(&text("hello bob", discussion.id))
            .await
            .unwrap();
        assert!(outcome.partial_error.is_none());
        let sent = outcome.message;
        assert_eq!(sent.payload, "hello bob");
        assert_eq!(sent.amt_msat, 1_000);
        assert!(sent.total_fees_msat > 0);
        assert_eq!(sent.sender.as_ref(), Some(alice.service.self_address()));
        assert_eq!(sent.receiver, Some(bob.sim.address()));
        assert_eq!(
            alice.service.get_discussion(discussion.id).unwrap().last_message_id,
            sent.id
        );

        let received = next_message(&mut inbox).await;
        assert_eq!(received.payload, "hello bob");
        assert_eq!(received.sender, Some(alice.sim.address()));
        assert!(received.sender_verified);
        assert_eq!(received.amt_msat, 1_000);

        let bob_discussion = bob.service.get_discussion(received.discussion_id).unwrap();
        assert_eq!(bob_discussion.participants_key(), participants_key(&[alice.sim.address(), bob.sim.address()]));
        assert_eq!(bob_discussion.last_message_id, received.id);

        let history = bob
            .service
            .get_history(received.discussion_id, &PageOptions::default())
            .unwrap();
        assert_eq!(history.len(), 1);

        let stats = alice.service.get_statistics(discussion.id).unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.amt_msat_sent, 1_000);

        alice.service.cleanup().await;
        bob.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_send_is_ambiguous_or_empty() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;

        let both = SendRequest {
            pay_req: "lnsim00".into(),
            ..text("hi", 5)
        };
        let err = alice.service.send_message(&both).await.unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));

        let neither = text("hi", 0);
        let err = alice.service.send_message(&neither).await.unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));

        let err = alice.service.send_message(&text("hi", 42)).await.unwrap_err();
        assert!(err.is(ErrorKind::NotFound));

        alice.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_anonymous_group_is_rejected() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let others: Vec<Address> = ["a", "b", "c"]
            .iter()
            .map(|alias| network.add_node(alias).address())
            .collect();

        let anonymous = MessageOptions {
            anonymous: true,
            ..MessageOptions::default()
        };
        let err = alice.service.add_discussion(&others, &anonymous).unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));

        // One-on-one is fine, and only once.
        alice.service.add_discussion(&others[..1], &anonymous).unwrap();
        let err = alice.service.add_discussion(&others[..1], &anonymous).unwrap_err();
        assert!(err.is(ErrorKind::AlreadyExists));

        alice.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_group_send_with_unreachable_member() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        let carol = peer(&network, "carol").await;
        alice
            .sim
            .fail_payments_to(&carol.sim.address(), FailureReason::NoRoute);

        let discussion = alice
            .service
            .add_discussion(
                &[bob.sim.address(), carol.sim.address()],
                &MessageOptions::default(),
            )
            .unwrap();
        let outcome = alice
            .service
            .send_message(&text("hi all", discussion.id))
            .await
            .unwrap();

        let partial = outcome.partial_error.expect("carol failed");
        assert!(partial.is(ErrorKind::NotFound));
        assert!(partial.description().contains(carol.sim.address().as_str()));
        assert_eq!(outcome.message.amt_msat, 1_000);
        assert_eq!(outcome.message.receiver, Some(bob.sim.address()));

        // Nobody reachable at all fails the send.
        alice
            .sim
            .fail_payments_to(&bob.sim.address(), FailureReason::InsufficientBalance);
        let err = alice
            .service
            .send_message(&text("again", discussion.id))
            .await
            .unwrap_err();
        assert!(
            err.is(ErrorKind::InsufficientBalance) || err.is(ErrorKind::NotFound),
            "unexpected {err}"
        );

        for p in [alice, bob, carol] {
            p.service.cleanup().await;
        }
    }

    #[tokio::test]
    async fn test_send_through_payment_request() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        let mut inbox = bob.service.subscribe_messages();

        let invoice = bob
            .service
            .create_invoice("coffee", 5_000, 3600, false)
            .await
            .unwrap();
        assert!(bob
            .service
            .store()
            .with(|db| db.find_invoice_by_add_index(invoice.invoice.add_index))
            .unwrap()
            .is_some());

        let request = SendRequest {
            payload: "for the coffee".into(),
            pay_req: invoice.invoice.payment_request.clone(),
            ..Default::default()
        };
        let estimate = alice.service.estimate_message(&request).await.unwrap();
        assert_eq!(estimate.amt_msat, 5_000);
        assert_eq!(estimate.id, 0);

        let outcome = alice.service.send_message(&request).await.unwrap();
        assert_eq!(outcome.message.amt_msat, 5_000);
        assert_eq!(outcome.message.pay_req, invoice.invoice.payment_request);
        assert!(!outcome.message.preimage.is_empty());

        let received = next_message(&mut inbox).await;
        assert_eq!(received.payload, "for the coffee");
        assert_eq!(received.index, 1);

        let looked_up = bob
            .service
            .lookup_invoice(&invoice.invoice.payment_request)
            .await
            .unwrap();
        assert!(looked_up.invoice.is_settled());

        alice.service.cleanup().await;
        bob.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_estimate_multiplies_probabilities() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        // Sim nodes stay reachable only while their handle lives.
        let bob = network.add_node("bob");
        let carol = network.add_node("carol");
        alice.sim.set_success_prob(&bob.address(), 0.5);
        alice.sim.set_success_prob(&carol.address(), 0.5);

        let discussion = alice
            .service
            .add_discussion(&[bob.address(), carol.address()], &MessageOptions::default())
            .unwrap();
        let estimate = alice
            .service
            .estimate_message(&text("?", discussion.id))
            .await
            .unwrap();
        assert_eq!(estimate.routes.len(), 2);
        assert_eq!(estimate.amt_msat, 2_000);
        assert!((estimate.success_prob - 0.25).abs() < 1e-9);
        assert!(alice
            .service
            .get_history(discussion.id, &PageOptions::default())
            .unwrap()
            .is_empty());

        alice.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_restart_does_not_duplicate_messages() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob_sim = network.add_node("bob");
        let bob_dir = tempfile::tempdir().unwrap();
        let db_path = bob_dir.path().join("lnchat.db");

        let bob = ChatService::start(Arc::new(bob_sim.clone()), &db_path)
            .await
            .unwrap();
        let mut inbox = bob.subscribe_messages();
        let discussion = alice
            .service
            .add_discussion(&[bob_sim.address()], &MessageOptions::default())
            .unwrap();
        alice
            .service
            .send_message(&text("once", discussion.id))
            .await
            .unwrap();
        let first = next_message(&mut inbox).await;
        bob.cleanup().await;

        // A second message arrives while bob is down.
        alice
            .service
            .send_message(&text("twice", discussion.id))
            .await
            .unwrap();

        let bob = ChatService::start(Arc::new(bob_sim.clone()), &db_path)
            .await
            .unwrap();
        let history = bob
            .get_history(first.discussion_id, &PageOptions::default())
            .unwrap();
        let payloads: Vec<&str> = history.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, vec!["once", "twice"]);

        bob.cleanup().await;
        alice.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_contacts_and_discussion_lifecycle() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = network.add_node("bob");
        let node = alice
            .service
            .search_node_by_address(&bob.address())
            .await
            .unwrap();
        assert_eq!(node.alias, "bob");
        assert_eq!(alice.service.search_node_by_alias("bob").await.unwrap(), vec![node.clone()]);

        let contact = alice.service.add_contact("Bobby", &node).unwrap();
        assert_eq!(alice.service.get_contact(contact.id).unwrap().display_name, "Bobby");
        let err = alice.service.add_contact("Bob again", &node).unwrap_err();
        assert!(err.is(ErrorKind::AlreadyExists));
        alice.service.remove_contact_by_address(&bob.address()).unwrap();
        let err = alice.service.remove_contact_by_id(contact.id).unwrap_err();
        assert!(err.is(ErrorKind::NotFound));

        let discussion = alice
            .service
            .add_discussion(&[bob.address()], &MessageOptions::default())
            .unwrap();
        let sent = alice
            .service
            .send_message(&text("hey", discussion.id))
            .await
            .unwrap()
            .message;
        alice.service.update_last_read(discussion.id, sent.id).unwrap();
        assert_eq!(
            alice.service.get_discussion(discussion.id).unwrap().last_read_id,
            sent.id
        );
        let err = alice
            .service
            .update_last_read(discussion.id, sent.id + 1)
            .unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));

        alice.service.remove_discussion(discussion.id).unwrap();
        let err = alice.service.get_discussion(discussion.id).unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
        assert!(alice
            .service
            .get_history(discussion.id, &PageOptions::default())
            .is_err());

        alice.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_reply_lands_in_senders_discussion() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        let mut alice_inbox = alice.service.subscribe_messages();
        let mut bob_inbox = bob.service.subscribe_messages();

        let discussion = alice
            .service
            .add_discussion(&[bob.sim.address()], &MessageOptions::default())
            .unwrap();
        alice
            .service
            .send_message(&text("ping", discussion.id))
            .await
            .unwrap();
        let received = next_message(&mut bob_inbox).await;

        bob.service
            .send_message(&text("pong", received.discussion_id))
            .await
            .unwrap();
        let reply = next_message(&mut alice_inbox).await;
        assert_eq!(reply.payload, "pong");
        assert_eq!(reply.discussion_id, discussion.id);
        assert_eq!(
            alice.service.get_discussion(discussion.id).unwrap().last_message_id,
            reply.id
        );
        assert_eq!(
            alice
                .service
                .get_discussions(&PageOptions::default())
                .unwrap()
                .len(),
            1
        );

        // And back again, still one conversation on each side.
        alice
            .service
            .send_message(&text("ping again", discussion.id))
            .await
            .unwrap();
        let again = next_message(&mut bob_inbox).await;
        assert_eq!(again.discussion_id, received.discussion_id);

        alice.service.cleanup().await;
        bob.service.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_survives_payment_stream_drop() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        let mut inbox = bob.service.subscribe_messages();
        alice.sim.set_settle_delay(Duration::from_millis(300));

        let discussion = alice
            .service
            .add_discussion(&[bob.sim.address()], &MessageOptions::default())
            .unwrap();
        let request = text("still here", discussion.id);
        let (outcome, _) = tokio::join!(
            alice.service.send_message(&request),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                alice.sim.close_streams();
            },
        );
        let outcome = outcome.unwrap();
        assert!(outcome.partial_error.is_none());
        assert_eq!(outcome.message.payload, "still here");
        assert_eq!(outcome.message.receiver, Some(bob.sim.address()));

        let stored = alice
            .service
            .core
            .store
            .with(|db| db.find_payment_by_index(1))
            .unwrap()
            .unwrap();
        assert_eq!(stored.payment.status, PaymentStatus::Succeeded);
        assert_eq!(next_message(&mut inbox).await.payload, "still here");

        alice.service.cleanup().await;
        bob.service.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_message_after_invoice_stream_drop() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        let mut inbox = bob.service.subscribe_messages();
        bob.sim.close_streams();

        let discussion = alice
            .service
            .add_discussion(&[bob.sim.address()], &MessageOptions::default())
            .unwrap();
        alice
            .service
            .send_message(&text("while you were away", discussion.id))
            .await
            .unwrap();

        let received = next_message(&mut inbox).await;
        assert_eq!(received.payload, "while you were away");
        assert_eq!(received.sender, Some(alice.sim.address()));
        assert_eq!(
            bob.service
                .get_history(received.discussion_id, &PageOptions::default())
                .unwrap()
                .len(),
            1
        );

        alice.service.cleanup().await;
        bob.service.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_recipient_leaves_partial_message() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        let carol = peer(&network, "carol").await;
        alice
            .sim
            .delay_payments_to(&carol.sim.address(), Duration::from_secs(3_600));

        let discussion = alice
            .service
            .add_discussion(
                &[bob.sim.address(), carol.sim.address()],
                &MessageOptions::default(),
            )
            .unwrap();
        let outcome = alice
            .service
            .send_message(&text("anyone?", discussion.id))
            .await
            .unwrap();

        let partial = outcome.partial_error.unwrap();
        assert!(partial.is(ErrorKind::DeadlineExceeded));
        assert!(partial
            .description()
            .contains(&carol.sim.address().to_string()));
        assert!(!partial.description().contains(&bob.sim.address().to_string()));

        let message = outcome.message;
        assert_eq!(message.receiver, Some(bob.sim.address()));
        assert_eq!(message.amt_msat, 1_000);
        assert_eq!(message.discussion_id, discussion.id);

        // The raw message knows about both payments, the pending one included.
        let raw = alice
            .service
            .core
            .store
            .with(|db| db.get_raw_message(message.raw_message_id))
            .unwrap();
        assert_eq!(raw.payment_indexes.len(), 2);
        let pending = alice
            .service
            .core
            .store
            .with(|db| db.min_pending_payment_index())
            .unwrap();
        assert!(pending.is_some());

        alice.service.cleanup().await;
        bob.service.cleanup().await;
        carol.service.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_every_recipient_timed_out() {
        let network = SimNetwork::new();
        let alice = peer(&network, "alice").await;
        let bob = peer(&network, "bob").await;
        alice
            .sim
            .delay_payments_to(&bob.sim.address(), Duration::from_secs(3_600));

        let discussion = alice
            .service
            .add_discussion(&[bob.sim.address()], &MessageOptions::default())
            .unwrap();
        let err = alice
            .service
            .send_message(&text("hello?", discussion.id))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::DeadlineExceeded));
        assert!(alice
            .service
            .get_history(discussion.id, &PageOptions::default())
            .unwrap()
            .is_empty());
        assert_eq!(
            alice.service.get_discussion(discussion.id).unwrap().last_message_id,
            0
        );

        alice.service.cleanup().await;
        bob.service.cleanup().await;
    }
}
