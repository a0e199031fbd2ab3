mod connection;
mod error;
mod identity;
mod metadata;
mod placeholder;
mod registration;

pub use connection::{
    CallbackEntry, CallbackTable, ConnectionKey, FetchCallbacks, FetchRequest, PinChange,
    PinEvent, SyncFilter, TransferKey, TransferStatus,
};
pub use error::FilterError;
pub use identity::FileIdentity;
pub use metadata::{attributes, MetadataStore, PlaceholderRecord, PlaceholderState};
pub use placeholder::PlaceholderStore;
pub use registration::{
    HardlinkPolicy, HydrationPolicy, InSyncPolicy, PopulationPolicy, RegistrationStore,
    SyncRootIdentity, SyncRootRegistration,
};
