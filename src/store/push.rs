use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::ChangeNotice;

use super::client::{AppointmentStore, BookingApi};

/// Feed remote change notices into `store` until `cancel` fires or the
/// channel closes. Delivery may duplicate or reorder; the reducer copes.
pub fn spawn_push_listener<A>(
    store: Arc<AppointmentStore<A>>,
    mut notices: broadcast::Receiver<ChangeNotice>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    A: BookingApi + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = notices.recv() => match received {
                    Ok(notice) => store.apply_notice(notice),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("push listener for shop {} lagged, {skipped} notices lost", store.shop_id());
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("push listener for shop {} stopped", store.shop_id());
    })
}
