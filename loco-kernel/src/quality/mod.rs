/**
 * QUALITY - Santé profonde des instances de la flotte
 *
 * RÔLE : Interroger l'endpoint de santé de chaque instance, valider le payload,
 * calculer le score SLA et classer la panne (network / process / client / mixed).
 *
 * FONCTIONNEMENT :
 * - Poll périodique, timeout et retry avec backoff par instance
 * - Parallélisme borné : une instance lente ne bloque pas les autres
 * - Rapports gardés en mémoire (dernier + historique court), jamais persistés
 * - Check léger en cache pour les listings, sans classification
 */

pub mod monitor;
pub mod report;

pub use monitor::{HealthMonitor, HealthProbe, HttpProbe, PollError, Reachability, SharedMonitor};
pub use report::{classify, sla_score, Classification, HealthBand, HealthReport, SubsystemFlags, SubsystemStatus};
