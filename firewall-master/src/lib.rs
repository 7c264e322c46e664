//! Master de gestion de pare-feux : suit la vivacité des agents, pilote leurs
//! règles de ports par streams corrélés et rapproche règles et ports en écoute.

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod firewall;
pub mod health;
pub mod heartbeat;
pub mod http;
pub mod models;
pub mod ports;
pub mod protocol;
pub mod reconcile;
pub mod refresh;
pub mod rules;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;
