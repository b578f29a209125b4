/*!
Mock bus client for development without a broker

Records every publish and lets tests simulate incoming messages, so bus
ingestion logic can be exercised with plain channels instead of MQTT.
*/

use anyhow::Result;
use prost::Message;
use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use vigia_wire::Reading;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock of the async bus client surface the gateway uses.
#[derive(Clone)]
pub struct MockBusClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockBusClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Channel on which simulated incoming messages are delivered.
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Record a publish (compatible with the AsyncClient call shape).
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        self.published_messages.lock().unwrap().push(message.clone());
        log::info!("[MOCK] published to {}: {} bytes", message.topic, message.payload.len());
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        self.subscriptions.lock().unwrap().push(topic.clone());
        log::info!("[MOCK] subscribed to {}", topic);
        Ok(())
    }

    /// Simulate the broker delivering a message (for tests).
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender
                .send(message.clone())
                .map_err(|e| anyhow::anyhow!("send error: {}", e))?;
        }
        log::info!("[MOCK] simulated incoming: {}", message.topic);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Decode the last message on a topic as a wire reading.
    pub fn get_last_reading(&self, topic: &str) -> Result<Option<Reading>> {
        let messages = self.find_messages_by_topic(topic);
        match messages.last() {
            Some(last) => Ok(Some(Reading::decode(&last.payload[..])?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

impl Default for MockBusClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::ReadingBuilder;

    #[tokio::test]
    async fn publish_and_subscribe_are_recorded() {
        let client = MockBusClient::new();

        client.subscribe("vigia/readings", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(client.get_subscriptions(), vec!["vigia/readings"]);

        let payload = b"raw bytes".to_vec();
        client
            .publish("vigia/readings", QoS::AtLeastOnce, false, payload.clone())
            .await
            .unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, payload);
    }

    #[tokio::test]
    async fn last_reading_decodes_from_the_topic() {
        let client = MockBusClient::new();
        let reading = ReadingBuilder::new("T1").value(21.5, "C").build();

        client
            .publish("vigia/readings", QoS::AtLeastOnce, false, reading.encode_to_vec())
            .await
            .unwrap();

        let last = client.get_last_reading("vigia/readings").unwrap().unwrap();
        assert_eq!(last.device_id, "T1");
        assert_eq!(last.value, 21.5);
        assert!(client.get_last_reading("other/topic").unwrap().is_none());
    }

    #[tokio::test]
    async fn simulated_messages_reach_the_receiver() {
        let client = MockBusClient::new();
        let mut receiver = client.setup_receiver();

        client.simulate_incoming("vigia/readings", b"hello".to_vec()).await.unwrap();
        let message = receiver.recv().await.unwrap();
        assert_eq!(message.topic, "vigia/readings");
        assert_eq!(message.payload, b"hello");
    }
}
