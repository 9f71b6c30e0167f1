//! In-process event bus for plugin-style hooks on the connection
//! lifecycle.
//!
//! Recipients are keyed by topic and run on their own tasks behind a
//! bounded inbox, so a slow subscriber can never stall the pipeline:
//! overflow and push-deadline drops are silent. Synchronous topics use a
//! reply channel; a `Deny` reply rejects the connection that triggered the
//! event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Events queued per recipient before new ones are dropped.
pub const INBOX_CAPACITY: usize = 100;

/// How long a queued event may wait on a busy handler before it is
/// dropped.
const PUSH_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::AsRefStr)]
pub enum Topic {
    PreConnProcessing,
    PostConnProcessing,
    PrePlayerJoin,
    PlayerJoin,
    PlayerLeave,
}

/// Connection context attached to an event. Fields are filled as far as
/// the pipeline has gotten when the event fires.
#[derive(Debug, Clone, Default)]
pub struct EventData {
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub requested_host: Option<String>,
    pub username: Option<String>,
    pub server_address: Option<String>,
    pub is_login: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Topic,
    pub data: EventData,
}

impl Event {
    pub fn new(topic: Topic, data: EventData) -> Self {
        Self { topic, data }
    }
}

/// A synchronous recipient's verdict on an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Allow,
    Deny { message: String },
}

struct Delivery {
    event: Event,
    reply: Option<flume::Sender<Reply>>,
}

enum Handler {
    Sync(Box<dyn FnMut(Event) -> Reply + Send>),
    Async(Box<dyn FnMut(Event) + Send>),
}

struct Recipient {
    topics: Vec<Topic>,
    inbox: flume::Sender<Delivery>,
}

impl Recipient {
    fn wants(&self, topic: Topic) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic)
    }
}

/// The bus itself. Cloning is cheap; all clones share the recipient map.
#[derive(Clone, Default)]
pub struct Bus {
    recipients: Arc<RwLock<HashMap<Uuid, Recipient>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a synchronous handler. Its reply answers `request`s on the
    /// subscribed topics.
    pub fn handle_sync(
        &self,
        topics: &[Topic],
        handler: impl FnMut(Event) -> Reply + Send + 'static,
    ) -> Uuid {
        self.attach(topics, Handler::Sync(Box::new(handler)))
    }

    /// Attaches a fire-and-forget handler. Requests on its topics are
    /// acknowledged with `Allow` before the handler runs.
    pub fn handle_async(
        &self,
        topics: &[Topic],
        handler: impl FnMut(Event) + Send + 'static,
    ) -> Uuid {
        self.attach(topics, Handler::Async(Box::new(handler)))
    }

    fn attach(&self, topics: &[Topic], handler: Handler) -> Uuid {
        let (inbox_tx, inbox_rx) = flume::bounded::<Delivery>(INBOX_CAPACITY);
        let (work_tx, work_rx) = flume::bounded::<Delivery>(0);

        tokio::spawn(forward(inbox_rx, work_tx));
        tokio::spawn(process(work_rx, handler));

        let id = Uuid::new_v4();
        self.recipients
            .write()
            .expect("event bus lock poisoned")
            .insert(
                id,
                Recipient {
                    topics: topics.to_vec(),
                    inbox: inbox_tx,
                },
            );
        id
    }

    /// Publishes an event to every recipient subscribed to its topic.
    pub fn push(&self, event: Event) {
        let recipients = self.recipients.read().expect("event bus lock poisoned");
        for recipient in recipients.values().filter(|r| r.wants(event.topic)) {
            let _ = recipient.inbox.try_send(Delivery {
                event: event.clone(),
                reply: None,
            });
        }
    }

    /// Publishes an event and returns the reply channel. It yields one
    /// reply per recipient that processed the event and closes once all
    /// have.
    pub fn request(&self, event: Event) -> flume::Receiver<Reply> {
        let (reply_tx, reply_rx) = flume::unbounded();
        let recipients = self.recipients.read().expect("event bus lock poisoned");
        for recipient in recipients.values().filter(|r| r.wants(event.topic)) {
            let _ = recipient.inbox.try_send(Delivery {
                event: event.clone(),
                reply: Some(reply_tx.clone()),
            });
        }
        reply_rx
    }

    /// Publishes a synchronous event and waits for the verdicts. Returns
    /// the first deny message, if any recipient denied.
    pub async fn request_denied(&self, event: Event) -> Option<String> {
        let replies = self.request(event);
        while let Ok(reply) = replies.recv_async().await {
            if let Reply::Deny { message } = reply {
                return Some(message);
            }
        }
        None
    }

    /// Detaches a recipient; its worker tasks wind down once the inbox
    /// drains.
    pub fn detach(&self, id: Uuid) -> bool {
        self.recipients
            .write()
            .expect("event bus lock poisoned")
            .remove(&id)
            .is_some()
    }

    pub fn detach_all(&self) -> usize {
        let mut recipients = self.recipients.write().expect("event bus lock poisoned");
        let count = recipients.len();
        recipients.clear();
        count
    }
}

async fn forward(inbox: flume::Receiver<Delivery>, work: flume::Sender<Delivery>) {
    while let Ok(delivery) = inbox.recv_async().await {
        // A handler still busy after the deadline loses this event.
        let _ = tokio::time::timeout(PUSH_DEADLINE, work.send_async(delivery)).await;
    }
}

async fn process(work: flume::Receiver<Delivery>, mut handler: Handler) {
    while let Ok(delivery) = work.recv_async().await {
        match &mut handler {
            Handler::Sync(handler) => {
                let reply = handler(delivery.event);
                if let Some(tx) = delivery.reply {
                    tx.send(reply).ok();
                }
            }
            Handler::Async(handler) => {
                if let Some(tx) = delivery.reply {
                    tx.send(Reply::Allow).ok();
                }
                handler(delivery.event);
            }
        }
    }
}
