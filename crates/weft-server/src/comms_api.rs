//! RPC surface of the three communication planes. Thin delegations; a plane
//! that is not configured answers `Unavailable`.

use std::collections::HashMap;

use tokio::sync::mpsc;

use weft_comms::{PublishReceipt, SubscriptionInfo};
use weft_types::{
    BusMessage, MemoryStats, MessagePayload, SharedMemoryChange, SharedNamespace, SharedValue,
    WeftError,
};

use crate::WeftServer;

impl WeftServer {
    /// `Publish` on the broadcast bus.
    pub fn publish(
        &self,
        topic: &str,
        from_agent: &str,
        payload: MessagePayload,
        metadata: HashMap<String, String>,
    ) -> Result<PublishReceipt, WeftError> {
        let (_, receipt) = self.bus()?.publish(topic, from_agent, payload, metadata)?;
        Ok(receipt)
    }

    /// `Subscribe` (server-stream): returns the subscription and its
    /// delivery channel.
    pub fn subscribe(
        &self,
        owner_agent_id: &str,
        topic_pattern: &str,
        buffer: usize,
    ) -> Result<(SubscriptionInfo, mpsc::Receiver<BusMessage>), WeftError> {
        self.bus()?.subscribe(owner_agent_id, topic_pattern, None, buffer)
    }

    /// Drop a bus subscription.
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<(), WeftError> {
        self.bus()?.unsubscribe(subscription_id)
    }

    /// Live subscriptions owned by one agent.
    pub fn subscriptions_by_agent(
        &self,
        owner_agent_id: &str,
    ) -> Result<Vec<SubscriptionInfo>, WeftError> {
        Ok(self.bus()?.subscriptions_by_agent(owner_agent_id))
    }

    /// `SendAsync`: fire-and-forget point-to-point send.
    pub fn send_async(
        &self,
        from_agent: &str,
        to_agent: &str,
        message_type: &str,
        payload: MessagePayload,
        metadata: HashMap<String, String>,
    ) -> Result<String, WeftError> {
        self.queue()?.send(from_agent, to_agent, message_type, payload, metadata)
    }

    /// `SendAndReceive`: request/reply with a deadline.
    pub async fn send_and_receive(
        &self,
        from_agent: &str,
        to_agent: &str,
        message_type: &str,
        payload: MessagePayload,
        metadata: HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<MessagePayload, WeftError> {
        self.queue()?
            .send_and_receive(from_agent, to_agent, message_type, payload, metadata, timeout_secs)
            .await
    }

    /// `PutSharedMemory`: returns `(new_version, created)`.
    pub fn put_shared_memory(
        &self,
        namespace: SharedNamespace,
        key: &str,
        value: Vec<u8>,
        agent_id: &str,
    ) -> Result<(u64, bool), WeftError> {
        self.memory()?.put(namespace, key, value, agent_id)
    }

    /// `GetSharedMemory`.
    pub fn get_shared_memory(
        &self,
        namespace: SharedNamespace,
        key: &str,
    ) -> Result<SharedValue, WeftError> {
        self.memory()?
            .get(namespace, key)
            .ok_or_else(|| WeftError::NotFound(format!("shared value {namespace}/{key}")))
    }

    /// `DeleteSharedMemory`.
    pub fn delete_shared_memory(
        &self,
        namespace: SharedNamespace,
        key: &str,
    ) -> Result<(), WeftError> {
        if self.memory()?.delete(namespace, key) {
            Ok(())
        } else {
            Err(WeftError::NotFound(format!("shared value {namespace}/{key}")))
        }
    }

    /// `ListSharedMemoryKeys`: keys plus the total live-key count.
    pub fn list_shared_memory_keys(
        &self,
        namespace: SharedNamespace,
        key_prefix: Option<&str>,
    ) -> Result<(Vec<String>, usize), WeftError> {
        Ok(self.memory()?.list(namespace, key_prefix))
    }

    /// `WatchSharedMemory` (stream).
    pub fn watch_shared_memory(
        &self,
        namespace: Option<SharedNamespace>,
        key_pattern: &str,
    ) -> Result<(String, mpsc::Receiver<SharedMemoryChange>), WeftError> {
        self.memory()?.watch(namespace, key_pattern)
    }

    /// `GetSharedMemoryStats`.
    pub fn shared_memory_stats(&self) -> Result<MemoryStats, WeftError> {
        Ok(self.memory()?.stats())
    }
}
