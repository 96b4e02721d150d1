/*!
# Loco DevKit - Stubs des collaborateurs du kernel

Bibliothèque facilitant les tests du kernel sans cluster ni instance réelle :
- Stub d'agent d'instance (endpoint de santé + actions de récupération)
- Stub d'API cluster (objets Endpoints / Pods)
- Backends TCP pour le tunnel (écho, fermeture côté backend, refus)
- Helpers de démarrage de serveurs éphémères
*/

pub mod agent_stub;
pub mod backend;
pub mod cluster_stub;
pub mod test_utils;

pub use agent_stub::{HealthPayloadBuilder, StubAgent};
pub use backend::{refused_addr, spawn_echo_backend, spawn_one_shot_backend};
pub use cluster_stub::{EndpointsBuilder, StubCluster};
pub use test_utils::{init_logging, serve};
