/// MQTT 3.1.1 client implementing [`Transport`](super::Transport).
pub mod mqtt;
