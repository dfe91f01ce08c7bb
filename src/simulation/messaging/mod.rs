pub mod communication;
pub mod message_broker;
pub mod messages;
