/**
 * LOCO KERNEL - Couche de coordination de la flotte d'instances virtuelles
 *
 * RÔLE : Découverte des instances, deep-health polling, récupération guidée par
 * circuit breaker, instance(s) active(s) diffusée(s) aux clients, relais temps réel.
 *
 * ARCHITECTURE : Discovery → Quality → Recovery (contrôle, sens unique) ;
 * Active → tous les clients (diffusion) ; Signaling / Tunnel = tuyaux par session.
 */

pub mod active;
pub mod config;
pub mod discovery;
pub mod events;
pub mod health;
pub mod http;
pub mod models;
pub mod quality;
pub mod recovery;
pub mod resilience;
pub mod session;
pub mod signaling;
pub mod tunnel;
