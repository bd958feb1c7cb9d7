/// Message routing between node ports
///
/// The router owns the routing table derived from the graph's edges and one
/// pending slot per input port. Publishing on an output wraps the payload in a
/// [`Message`] and drops a copy into the slot of every subscribed input; the
/// slot holds the latest message until the consumer's next invocation takes it.

use crate::error::RoutingError;
use crate::workflow::types::{Graph, PortRef};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Immutable envelope for one published value
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Producing `(node, output port)`
    pub origin: PortRef,
    /// Monotonic per-origin sequence number, starting at 1
    pub sequence: u64,
    /// Shared payload; every delivery of one publish points at the same value
    pub payload: Arc<Value>,
}

impl Message {
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Routing table plus pending input slots for one Run
#[derive(Debug, Default)]
pub struct MessageRouter {
    /// Declared output port → subscribed input ports, in edge order
    routes: HashMap<PortRef, Vec<PortRef>>,
    /// Every declared input port
    inputs: HashSet<PortRef>,
    /// Last sequence number issued per output port
    sequences: HashMap<PortRef, u64>,
    /// Latest undelivered message per input port
    slots: HashMap<PortRef, Message>,
}

impl MessageRouter {
    /// Build the routing table for a validated graph
    ///
    /// Every declared output gets an entry, even without subscribers, so that
    /// publishing on it is legal.
    pub fn from_graph(graph: &Graph) -> Self {
        let mut router = Self::default();
        for node in graph.nodes() {
            for port in &node.outputs {
                router.declare_output(PortRef::new(node.id.clone(), port.clone()));
            }
            for port in &node.inputs {
                router.declare_input(PortRef::new(node.id.clone(), port.name.clone()));
            }
        }

        for edge in graph.edges() {
            // Validation guarantees both ends are declared
            if let Err(e) = router.subscribe(edge.from.clone(), edge.to.clone()) {
                tracing::error!("❌ Failed to register route {}: {}", edge, e);
            }
        }

        tracing::debug!(
            "🔗 Router ready: {} output ports, {} routes",
            router.routes.len(),
            graph.edges().len()
        );
        router
    }

    /// Add an output port that may be published to, with no subscribers yet
    pub fn declare_output(&mut self, port: PortRef) {
        self.routes.entry(port).or_default();
    }

    /// Add an input port that may subscribe and hold a pending message
    pub fn declare_input(&mut self, port: PortRef) {
        self.inputs.insert(port);
    }

    /// Register `to` as a subscriber of `from`
    pub fn subscribe(&mut self, from: PortRef, to: PortRef) -> Result<(), RoutingError> {
        if !self.inputs.contains(&to) {
            return Err(RoutingError::UndeclaredInput {
                node: to.node,
                port: to.port,
            });
        }
        let subscribers = self
            .routes
            .get_mut(&from)
            .ok_or(RoutingError::UndeclaredOutput {
                node: from.node,
                port: from.port,
            })?;
        subscribers.push(to);
        Ok(())
    }

    /// Input ports bound to `from`
    pub fn subscribers(&self, from: &PortRef) -> &[PortRef] {
        self.routes.get(from).map(Vec::as_slice).unwrap_or_default()
    }

    /// Publish a payload on `node/port`, delivering once per subscribed edge
    ///
    /// Returns the input ports that received the message, in edge order.
    pub fn publish(
        &mut self,
        node: &str,
        port: &str,
        payload: Value,
    ) -> Result<Vec<PortRef>, RoutingError> {
        let origin = PortRef::new(node, port);
        let Some(subscribers) = self.routes.get(&origin) else {
            return Err(RoutingError::UndeclaredOutput {
                node: node.to_string(),
                port: port.to_string(),
            });
        };

        let sequence = self.sequences.entry(origin.clone()).or_insert(0);
        *sequence += 1;

        let message = Message {
            origin,
            sequence: *sequence,
            payload: Arc::new(payload),
        };

        let destinations = subscribers.clone();
        for destination in &destinations {
            tracing::trace!(
                "📨 {} #{} → {}",
                message.origin,
                message.sequence,
                destination
            );
            self.slots.insert(destination.clone(), message.clone());
        }

        Ok(destinations)
    }

    /// Pending message on an input port, if any
    pub fn pending(&self, port: &PortRef) -> Option<&Message> {
        self.slots.get(port)
    }

    /// Consume every pending input of `node`, keyed by input port name
    pub fn take_inputs(&mut self, node: &str) -> HashMap<String, Message> {
        let ports: Vec<PortRef> = self
            .slots
            .keys()
            .filter(|port| port.node == node)
            .cloned()
            .collect();

        ports
            .into_iter()
            .filter_map(|port| {
                let message = self.slots.remove(&port)?;
                Some((port.port, message))
            })
            .collect()
    }
}
