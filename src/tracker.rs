//! Circuit and stream tracking: which relays carry which domain.
//!
//! The tracker consumes `CIRC` and `STREAM` events from a
//! [`Controller`] and maintains three maps:
//!
//! | Map | Keyed by | Holds |
//! |-----|----------|-------|
//! | `circuits` | circuit id | the relay path observed at `BUILT` |
//! | `circuit_domain` | circuit id | the first domain a stream carried |
//! | `domain_nodes` | domain | the three [`NodeInfo`] records serving it |
//!
//! When a stream reaches `SENTCONNECT` on a circuit with no domain yet, the
//! circuit is bound to the stream's target domain (first SENTCONNECT wins
//! per circuit), the circuit's first three hops are resolved to
//! [`NodeInfo`] records via `GETINFO ns/id/<fp>` and `ip-to-country/<ip>`
//! batches, and a [`NodesUpdate`] is published (first circuit wins per
//! domain). A stream naming an unknown circuit is skipped silently — the
//! `BUILT` event may simply not have arrived — as is a circuit with fewer
//! than three hops.
//!
//! Events are processed strictly in arrival order on one task, and the
//! circuit→domain binding happens before the relay lookups are issued, so
//! concurrent streams on the same new circuit can never enqueue duplicate
//! `GETINFO` batches.
//!
//! The display collaborator consumes
//! [`TrackerHandle::next_update`] and reads back
//! [`TrackerHandle::nodes_for_domain`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Controller, EventSubscription};
use crate::error::{Error, Result};
use crate::events::{
    CircuitEvent, CircuitStatus, EventType, PathHop, StreamEvent, StreamStatus,
};
use crate::getinfo::InfoValue;

/// One relay of a circuit, resolved for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// 40-hex-character relay fingerprint.
    pub fingerprint: String,
    /// Relay nickname from its router status.
    pub nickname: String,
    /// Dotted-quad relay address.
    pub ip: String,
    /// Two-letter country code, as Tor reports it.
    pub country_code: String,
}

/// A circuit whose `BUILT` status has been observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitRecord {
    /// Circuit identifier.
    pub id: String,
    /// Last observed status.
    pub status: CircuitStatus,
    /// Relay path at `BUILT` time.
    pub path: Vec<PathHop>,
    /// Circuit purpose, when announced.
    pub purpose: Option<String>,
    /// Build flags, when announced.
    pub build_flags: Vec<String>,
}

impl From<CircuitEvent> for CircuitRecord {
    fn from(event: CircuitEvent) -> Self {
        CircuitRecord {
            id: event.id,
            status: event.status,
            path: event.path,
            purpose: event.purpose,
            build_flags: event.build_flags,
        }
    }
}

/// Notification that a domain's relay chain was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesUpdate {
    /// Domain the circuit is carrying.
    pub domain: String,
    /// Entry, middle, and exit relays, in path order.
    pub nodes: [NodeInfo; 3],
}

enum TrackerEvent {
    Circuit(CircuitEvent),
    Stream(StreamEvent),
}

/// Consumer side of a running tracker.
pub struct TrackerHandle {
    domain_nodes: Arc<StdMutex<HashMap<String, [NodeInfo; 3]>>>,
    updates: mpsc::UnboundedReceiver<NodesUpdate>,
    subscriptions: Vec<EventSubscription>,
    task: JoinHandle<()>,
}

impl TrackerHandle {
    /// Waits for the next resolved domain.
    ///
    /// Returns `None` once the tracker has shut down.
    pub async fn next_update(&mut self) -> Option<NodesUpdate> {
        self.updates.recv().await
    }

    /// The relay chain resolved for `domain`, if any.
    pub fn nodes_for_domain(&self, domain: &str) -> Option<[NodeInfo; 3]> {
        self.domain_nodes.lock().unwrap().get(domain).cloned()
    }

    /// Cancels the event subscriptions and waits for the tracker task.
    pub async fn shutdown(self) {
        for subscription in self.subscriptions {
            subscription.cancel();
        }
        let _ = self.task.await;
    }
}

/// Event-driven tracker state. Runs on its own task; see
/// [`CircuitTracker::launch`].
pub struct CircuitTracker {
    controller: Arc<Controller>,
    circuits: HashMap<String, CircuitRecord>,
    circuit_domain: HashMap<String, String>,
    domain_nodes: Arc<StdMutex<HashMap<String, [NodeInfo; 3]>>>,
    updates: mpsc::UnboundedSender<NodesUpdate>,
}

impl CircuitTracker {
    /// Subscribes to `CIRC` and `STREAM` events on `controller` and spawns
    /// the tracking task.
    pub fn launch(controller: Arc<Controller>) -> TrackerHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let domain_nodes = Arc::new(StdMutex::new(HashMap::new()));

        let circ_tx = event_tx.clone();
        let circ_sub = controller.watch_event(
            EventType::Circ,
            |_| true,
            move |record| match CircuitEvent::from_record(record) {
                Ok(event) => {
                    let _ = circ_tx.send(TrackerEvent::Circuit(event));
                }
                Err(e) => debug!("dropping unparsable CIRC event: {}", e),
            },
        );
        let stream_tx = event_tx;
        let stream_sub = controller.watch_event(
            EventType::Stream,
            |_| true,
            move |record| match StreamEvent::from_record(record) {
                Ok(event) => {
                    let _ = stream_tx.send(TrackerEvent::Stream(event));
                }
                Err(e) => debug!("dropping unparsable STREAM event: {}", e),
            },
        );

        let tracker = CircuitTracker {
            controller,
            circuits: HashMap::new(),
            circuit_domain: HashMap::new(),
            domain_nodes: domain_nodes.clone(),
            updates: update_tx,
        };
        let task = tokio::spawn(tracker.run(event_rx));

        TrackerHandle {
            domain_nodes,
            updates: update_rx,
            subscriptions: vec![circ_sub, stream_sub],
            task,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<TrackerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TrackerEvent::Circuit(circuit) => self.on_circuit(circuit),
                TrackerEvent::Stream(stream) => self.on_stream(stream).await,
            }
        }
    }

    fn on_circuit(&mut self, event: CircuitEvent) {
        match event.status {
            CircuitStatus::Built => {
                debug!(circuit = %event.id, hops = event.path.len(), "circuit built");
                self.circuits.insert(event.id.clone(), event.into());
            }
            CircuitStatus::Closed | CircuitStatus::Failed => {
                // A record that already served its domain assignment has no
                // further use; one still awaiting its first stream is kept.
                if self.circuit_domain.contains_key(&event.id) {
                    self.circuits.remove(&event.id);
                }
            }
            CircuitStatus::Launched | CircuitStatus::Extended => {}
        }
    }

    async fn on_stream(&mut self, event: StreamEvent) {
        if event.status != StreamStatus::SentConnect {
            return;
        }
        if self.circuit_domain.contains_key(&event.circuit_id) {
            return;
        }
        let Some(circuit) = self.circuits.get(&event.circuit_id) else {
            debug!(
                circuit = %event.circuit_id,
                stream = %event.id,
                "stream references a circuit never seen BUILT; skipping"
            );
            return;
        };
        if circuit.path.len() < 3 {
            debug!(circuit = %event.circuit_id, hops = circuit.path.len(), "short path; skipping");
            return;
        }

        let domain = event.target_host().to_string();
        let fingerprints: Vec<String> = circuit
            .path
            .iter()
            .take(3)
            .map(|hop| hop.fingerprint.clone())
            .collect();

        // Bind before issuing lookups: a second stream on this circuit
        // arriving mid-resolution must find the assignment already made.
        self.circuit_domain
            .insert(event.circuit_id.clone(), domain.clone());

        if self.domain_nodes.lock().unwrap().contains_key(&domain) {
            return;
        }

        match self.resolve_nodes(&fingerprints).await {
            Ok(nodes) => {
                self.domain_nodes
                    .lock()
                    .unwrap()
                    .insert(domain.clone(), nodes.clone());
                info!(domain = %domain, circuit = %event.circuit_id, "resolved relay chain");
                let _ = self.updates.send(NodesUpdate { domain, nodes });
            }
            Err(e) => {
                warn!(domain = %domain, "relay lookup failed: {}", e);
            }
        }
    }

    /// Resolves three fingerprints to [`NodeInfo`] records: one batched
    /// `ns/id/*` request, then one batched `ip-to-country/*` request.
    async fn resolve_nodes(&self, fingerprints: &[String]) -> Result<[NodeInfo; 3]> {
        let ns_keys: Vec<String> = fingerprints
            .iter()
            .map(|fp| format!("ns/id/{}", fp))
            .collect();
        let statuses = self.controller.get_info_multiple(&ns_keys).await?;

        let mut routers = Vec::with_capacity(fingerprints.len());
        for (fp, key) in fingerprints.iter().zip(&ns_keys) {
            let router = statuses
                .get(key)
                .and_then(InfoValue::as_router)
                .ok_or_else(|| Error::Parse(format!("no router status for {}", fp)))?;
            routers.push(router.clone());
        }

        let country_keys: Vec<String> = routers
            .iter()
            .map(|router| format!("ip-to-country/{}", router.address))
            .collect();
        let countries = self.controller.get_info_multiple(&country_keys).await?;

        let mut nodes = Vec::with_capacity(fingerprints.len());
        for ((fp, router), key) in fingerprints.iter().zip(routers).zip(&country_keys) {
            let country_code = countries
                .get(key)
                .and_then(InfoValue::as_str)
                .ok_or_else(|| Error::Parse(format!("no country for {}", key)))?
                .to_string();
            nodes.push(NodeInfo {
                fingerprint: fp.clone(),
                nickname: router.nickname,
                ip: router.address,
                country_code,
            });
        }
        nodes
            .try_into()
            .map_err(|_| Error::Parse("expected exactly three relays".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Controller;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);

    fn fp(ch: char) -> String {
        std::iter::repeat(ch).take(40).collect()
    }

    async fn read_command(server: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    async fn send(server: &mut BufReader<DuplexStream>, text: &str) {
        server.get_mut().write_all(text.as_bytes()).await.unwrap();
    }

    async fn connect_pair() -> (Arc<Controller>, BufReader<DuplexStream>) {
        let (client, server) = duplex(64 * 1024);
        let mut server = BufReader::new(server);

        let launch = Controller::launch("test:9151".to_string(), client, "pw", None);
        let handshake = async {
            let _ = read_command(&mut server).await;
            send(&mut server, "250 OK\r\n").await;
            let _ = read_command(&mut server).await;
            send(&mut server, "250 OK\r\n").await;
        };
        let (controller, ()) = tokio::join!(launch, handshake);
        (Arc::new(controller.unwrap()), server)
    }

    fn ns_body(key: &str, nickname: &str, ip: &str) -> String {
        format!(
            "250+{}=\r\nr {} AAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-03-01 12:00:00 {} 9001 0\r\ns Fast Running Valid\r\n.\r\n",
            key, nickname, ip
        )
    }

    /// Answers one `getinfo ns/id/..` batch for three relays.
    async fn answer_ns_batch(server: &mut BufReader<DuplexStream>, relays: &[(String, &str, &str)]) {
        let command = read_command(server).await;
        let expected: Vec<String> = relays
            .iter()
            .map(|(fingerprint, _, _)| format!("ns/id/{}", fingerprint))
            .collect();
        assert_eq!(command, format!("getinfo {}", expected.join(" ")));

        let mut reply = String::new();
        for ((_, nickname, ip), key) in relays.iter().zip(&expected) {
            reply.push_str(&ns_body(key, nickname, ip));
        }
        reply.push_str("250 OK\r\n");
        send(server, &reply).await;
    }

    /// Answers one `getinfo ip-to-country/..` batch.
    async fn answer_country_batch(server: &mut BufReader<DuplexStream>, entries: &[(&str, &str)]) {
        let command = read_command(server).await;
        let expected: Vec<String> = entries
            .iter()
            .map(|(ip, _)| format!("ip-to-country/{}", ip))
            .collect();
        assert_eq!(command, format!("getinfo {}", expected.join(" ")));

        let mut reply = String::new();
        for ((_, country), key) in entries.iter().zip(&expected) {
            reply.push_str(&format!("250-{}={}\r\n", key, country));
        }
        reply.push_str("250 OK\r\n");
        send(server, &reply).await;
    }

    #[tokio::test]
    async fn test_domain_assignment_end_to_end() {
        // Scenario S4: BUILT circuit, then SENTCONNECT stream, then the
        // two GETINFO batches, then exactly one notification.
        let (controller, mut server) = connect_pair().await;
        let mut handle = CircuitTracker::launch(controller);

        let (fp_a, fp_b, fp_c) = (fp('A'), fp('B'), fp('C'));
        send(
            &mut server,
            &format!(
                "650 CIRC 4 BUILT ${}~alpha,${}~beta,${}~gamma PURPOSE=GENERAL\r\n",
                fp_a, fp_b, fp_c
            ),
        )
        .await;
        send(&mut server, "650 STREAM 7 SENTCONNECT 4 example.com:443\r\n").await;

        let relays = [
            (fp_a.clone(), "alpha", "10.0.0.1"),
            (fp_b.clone(), "beta", "10.0.0.2"),
            (fp_c.clone(), "gamma", "10.0.0.3"),
        ];
        answer_ns_batch(&mut server, &relays).await;
        answer_country_batch(
            &mut server,
            &[("10.0.0.1", "de"), ("10.0.0.2", "fr"), ("10.0.0.3", "us")],
        )
        .await;

        let update = timeout(Duration::from_secs(1), handle.next_update())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.domain, "example.com");
        assert_eq!(update.nodes[0].nickname, "alpha");
        assert_eq!(update.nodes[0].ip, "10.0.0.1");
        assert_eq!(update.nodes[0].country_code, "de");
        assert_eq!(update.nodes[1].fingerprint, fp_b);
        assert_eq!(update.nodes[2].country_code, "us");

        let nodes = handle.nodes_for_domain("example.com").unwrap();
        assert_eq!(nodes, update.nodes);

        // A second stream on the same circuit issues no further GETINFO
        // and no further notification.
        send(
            &mut server,
            "650 STREAM 9 SENTCONNECT 4 other.example.com:80\r\n",
        )
        .await;
        assert!(timeout(TICK, read_command(&mut server)).await.is_err());
        assert!(timeout(TICK, handle.next_update()).await.is_err());
        assert!(handle.nodes_for_domain("other.example.com").is_none());

        // A different circuit reaching an already-resolved domain binds
        // the circuit but resolves nothing (first circuit wins).
        send(
            &mut server,
            &format!(
                "650 CIRC 8 BUILT ${}~alpha,${}~beta,${}~gamma\r\n",
                fp_a, fp_b, fp_c
            ),
        )
        .await;
        send(&mut server, "650 STREAM 11 SENTCONNECT 8 example.com:443\r\n").await;
        assert!(timeout(TICK, read_command(&mut server)).await.is_err());
        assert!(timeout(TICK, handle.next_update()).await.is_err());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_for_unknown_circuit_is_skipped() {
        let (controller, mut server) = connect_pair().await;
        let mut handle = CircuitTracker::launch(controller);

        send(&mut server, "650 STREAM 7 SENTCONNECT 99 example.com:443\r\n").await;

        assert!(timeout(TICK, read_command(&mut server)).await.is_err());
        assert!(timeout(TICK, handle.next_update()).await.is_err());
        assert!(handle.nodes_for_domain("example.com").is_none());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_short_path_records_no_assignment() {
        let (controller, mut server) = connect_pair().await;
        let mut handle = CircuitTracker::launch(controller);

        send(
            &mut server,
            &format!("650 CIRC 4 BUILT ${}~alpha,${}~beta\r\n", fp('A'), fp('B')),
        )
        .await;
        send(&mut server, "650 STREAM 7 SENTCONNECT 4 example.com:443\r\n").await;

        assert!(timeout(TICK, read_command(&mut server)).await.is_err());
        assert!(handle.nodes_for_domain("example.com").is_none());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_sentconnect_streams_ignored() {
        let (controller, mut server) = connect_pair().await;
        let mut handle = CircuitTracker::launch(controller);

        send(
            &mut server,
            &format!(
                "650 CIRC 4 BUILT ${}~a,${}~b,${}~c\r\n",
                fp('A'),
                fp('B'),
                fp('C')
            ),
        )
        .await;
        send(&mut server, "650 STREAM 7 NEW 4 example.com:443\r\n").await;
        send(&mut server, "650 STREAM 7 SUCCEEDED 4 example.com:443\r\n").await;

        assert!(timeout(TICK, read_command(&mut server)).await.is_err());
        assert!(timeout(TICK, handle.next_update()).await.is_err());

        handle.shutdown().await;
    }
}
