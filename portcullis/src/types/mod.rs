//! Resources the authority stores in the backend, plus the role model the
//! issuance engine consults.

mod authority;
mod lock;
mod presence;
mod role;
mod rotation;
mod token;

pub use authority::{
    CAKeySet, CertAuthID, CertAuthType, CertAuthority, JwtKeyPair, KeyKind, PrivateKeyRef,
    PrivateKeyType, SshKeyPair, TlsKeyPair,
};
pub use lock::{lock_in_force_message, lock_key, Lock, LockTarget, LockingMode};
pub use presence::{KubernetesCluster, RemoteCluster};
pub use role::{AccessChecker, PrivateKeyPolicy, Role, RoleConditions, RoleOptions, RoleSet};
pub use rotation::{Rotation, RotationMode, RotationPhase, RotationSchedule, RotationState};
pub use token::{token_key, ProvisionToken, SystemRole};
