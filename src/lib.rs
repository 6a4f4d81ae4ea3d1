pub mod balance;
pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod http;
pub mod registry;
pub mod server;
pub mod service;
pub mod xclient;

pub use balance::{LoadBalance, Mode, RegistryLoadBalancer, StaticLoadBalancer};
pub use client::{Call, Client};
pub use codec::{BincodeCodec, Codec, CodecType, Header, JsonCodec, Options, MAGIC_NUMBER};
pub use error::{Result, RpcError};
pub use frame::{FrameReader, FrameWriter, MAX_FRAME_SIZE};
pub use http::{serve_http, DEFAULT_DEBUG_PATH, DEFAULT_HANDLE_PATH};
pub use registry::{
    heartbeat_once, start_heartbeat, Registry, DEFAULT_HEARTBEAT_PERIOD, DEFAULT_REGISTRY_PATH,
    SERVERS_HEADER, SERVER_HEADER,
};
pub use server::Server;
pub use service::{RpcMethod, Service};
pub use xclient::XClient;
