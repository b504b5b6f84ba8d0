//! The downstream side as seen by a router.
//!
//! A `DecoderFilterCallbacks` object is handed to every router. For a
//! transaction started by a downstream client it is that transaction's
//! handle on its connection; for a connection registered in
//! `DownstreamConnectionInfos` it accepts requests initiated upstream.

use std::rc::Rc;
use std::sync::Arc;

use crate::router::downstream::DownstreamConnectionInfos;
use crate::router::origin_ingress::OriginIngress;
use crate::router::transaction::ThreadLocalTransactionInfos;
use crate::router::ResponseStatus;
use crate::routing::RouteEntry;
use crate::sip::MessageMetadataRef;
use crate::tra::TraHandler;

pub trait DecoderFilterCallbacks {
    fn transaction_id(&self) -> &str;

    fn route(&self) -> Option<Arc<RouteEntry>>;

    /// Worker and connection stamped on forwarded requests.
    fn origin_ingress(&self) -> Option<OriginIngress>;

    fn transaction_infos(&self) -> Rc<ThreadLocalTransactionInfos>;

    fn downstream_connection_infos(&self) -> Rc<DownstreamConnectionInfos>;

    fn tra_handler(&self) -> Option<Rc<TraHandler>> {
        None
    }

    /// Deliver a message that arrived from upstream. `return_destination`
    /// is set for requests initiated upstream: the host their responses
    /// must go back to.
    fn upstream_data(
        &self,
        metadata: MessageMetadataRef,
        route: Option<Arc<RouteEntry>>,
        return_destination: Option<String>,
    ) -> ResponseStatus;

    /// Park this transaction until `(kind, key)` settles.
    fn push_into_pending_list(&self, _kind: &str, _key: &str) {}

    /// The connection to `key` settled; resume what waits on it.
    fn continue_handling(&self, _key: &str, _try_next_affinity: bool) {}

    /// The transaction expired without completing.
    fn on_reset(&self) {}
}
