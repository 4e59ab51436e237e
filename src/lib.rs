#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc = include_str!("../README.md")]

mod client;
pub use client::{
    ClientEvent, Connection, PersistentSubscription, Subscription, Transaction, MAX_READ_SIZE,
};

mod errors;
pub use errors::Error;

pub mod discovery;
pub mod proto;

mod metadata;
pub use metadata::{StreamAcl, StreamMetadata, StreamMetadataResult};

mod settings;
pub use settings::{
    ClusterSettings, Credentials, NodeAddress, Settings, SettingsBuilder, SslSettings, TcpSettings,
};

mod types;
pub use types::{
    AllEventsSlice, DeleteResult, EventData, EventReadResult, EventReadStatus, ExpectedVersion,
    NakAction, NodeEndpoints, PersistentSubscriptionSettings, Position, ReadDirection,
    RecordedEvent, ResolvedEvent, SliceReadStatus, StreamEventsSlice, SubDropReason,
    SubscriptionEvent, SystemConsumerStrategy, WriteResult,
};

mod operations;

pub use futures_util::StreamExt;
