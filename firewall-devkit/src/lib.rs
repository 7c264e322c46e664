/*!
# Firewall DevKit - Agents simulés et harness pour le firewall master

Bibliothèque facilitant le développement et les tests du master avec:
- Agents simulés sur broker en mémoire (réponses, silence, erreurs)
- Builders de heartbeats, rapports d'usage et règles au format agent
- Harness assemblant un master complet
*/

pub mod agent_sim;
pub mod fixtures;
pub mod harness;

pub use agent_sim::{Reaction, SimulatedAgent};
pub use harness::TestHarness;
