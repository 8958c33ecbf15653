//! An expressive routing and request/response layer over [`matchit`] and [`hyper`].
//!
//! Handlers receive a [`Context`] with eagerly decoded input and return a deferred [`Response`]
//! descriptor that the dispatch layer renders; route groups accumulate prefixes and middleware
//! on top of the underlying router.

mod body;
mod context;
mod handler;
mod middleware;
mod request;
mod response;
mod server;
mod stream;
mod view;

pub mod router;

pub use body::{BodyRef, BodyValue, DecodeError, DecodedBody, UploadedFile};
pub use context::{Context, Cookie, ResponseHandle, SameSite};
pub use handler::{Handler, Middleware, Next, ResourceController};
pub use middleware::{AccessLog, ShareViewData};
pub use request::{PathParams, Request};
pub use response::{Response, ResponseBody, Status};
pub use router::{Group, Router};
pub use server::{Server, ServerBuildError, ServerBuilder};
pub use stream::StreamWriter;
pub use view::{SharedViewData, ToViewData, View, ViewEngine, ViewError};
