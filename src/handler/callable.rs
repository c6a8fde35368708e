use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A serializable unit of work.
///
/// The value is encoded on the calling side, shipped to the peer, decoded
/// there and run by [`call`](Callable::call). The peer must have the same
/// type registered (see [`ChannelBuilder::register`]) under the same
/// [`NAME`](Callable::NAME).
///
/// A work value may carry [`Pipe`](crate::stream::Pipe)s to stream data in
/// either direction while it runs.
///
/// # Example
///
/// ```
/// use remoting::Callable;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Add(u32, u32);
///
/// impl Callable for Add {
///     const NAME: &'static str = "add";
///     type Output = u32;
///     type Error = String;
///
///     async fn call(self) -> Result<u32, String> {
///         self.0.checked_add(self.1).ok_or_else(|| "overflow".to_string())
///     }
/// }
/// ```
///
/// [`ChannelBuilder::register`]: crate::ChannelBuilder::register
pub trait Callable: Serialize + DeserializeOwned + Send + 'static {
    /// Name the work is registered and dispatched under.
    const NAME: &'static str;

    /// Value returned on success.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Error the work itself may fail with.
    type Error: Serialize + DeserializeOwned + Send + 'static;

    /// Run the work.
    fn call(self) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;
}
