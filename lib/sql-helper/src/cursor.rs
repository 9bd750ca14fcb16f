//! Forward-only row cursors and the connection ownership they carry.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::{Backend, CommandExecutor, DataTable, PreparedCommand, Row, SqlHelperError};

/// Rows buffered ahead of the consumer for an internally owned cursor.
const ROW_BUFFER: usize = 64;

/// Who is responsible for the connection behind a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOwnership {
    /// The helper opened the connection; closing the cursor closes it.
    Internal,
    /// The caller supplied the connection or transaction and manages it.
    External,
}

/// A lazy, forward-only, single-pass sequence of rows.
///
/// An internally owned cursor holds a connection until it is drained,
/// closed, or dropped. Dropping it releases the connection in the
/// background; [`RowCursor::close`] waits until the connection is released.
pub struct RowCursor<'c> {
    ownership: ConnectionOwnership,
    source: Source<'c>,
}

enum Source<'c> {
    Borrowed(BoxStream<'c, Result<Row, SqlHelperError>>),
    Owned(OwnedRows),
}

struct OwnedRows {
    pending: Option<Result<Row, SqlHelperError>>,
    rows: mpsc::Receiver<Result<Row, SqlHelperError>>,
    worker: JoinHandle<Result<(), SqlHelperError>>,
}

impl<'c> RowCursor<'c> {
    /// A cursor over rows of a connection or transaction the caller owns.
    pub fn external(rows: BoxStream<'c, Result<Row, SqlHelperError>>) -> Self {
        Self {
            ownership: ConnectionOwnership::External,
            source: Source::Borrowed(rows),
        }
    }

    pub fn ownership(&self) -> ConnectionOwnership {
        self.ownership
    }

    /// Stop reading and release the connection if the cursor owns it.
    pub async fn close(self) -> Result<(), SqlHelperError> {
        match self.source {
            Source::Borrowed(rows) => {
                drop(rows);
                Ok(())
            }
            Source::Owned(owned) => {
                let OwnedRows { rows, worker, .. } = owned;
                drop(rows);
                join_worker(worker).await
            }
        }
    }

    /// Drain the remaining rows into a table, then close the cursor.
    pub async fn into_table(mut self) -> Result<DataTable, SqlHelperError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            match row {
                Ok(row) => rows.push(row),
                Err(e) => {
                    // The row error is the one worth reporting.
                    let _ = self.close().await;
                    return Err(e);
                }
            }
        }
        self.close().await?;
        Ok(DataTable::from_rows(rows))
    }
}

impl RowCursor<'static> {
    /// Run a command on a connection the cursor takes ownership of.
    ///
    /// Waits for the first row so that a failing command is reported here,
    /// after its connection has been closed.
    pub(crate) async fn internal<B: Backend>(
        backend: Arc<B>,
        connection: B::Connection,
        command: PreparedCommand,
    ) -> Result<Self, SqlHelperError> {
        let (tx, mut rx) = mpsc::channel(ROW_BUFFER);
        let worker = tokio::spawn(drain_rows(backend, connection, command, tx));

        match rx.recv().await {
            Some(Err(e)) => {
                drop(rx);
                let _ = join_worker(worker).await;
                Err(e)
            }
            first => Ok(Self {
                ownership: ConnectionOwnership::Internal,
                source: Source::Owned(OwnedRows {
                    pending: first,
                    rows: rx,
                    worker,
                }),
            }),
        }
    }
}

impl Stream for RowCursor<'_> {
    type Item = Result<Row, SqlHelperError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().source {
            Source::Borrowed(rows) => rows.poll_next_unpin(cx),
            Source::Owned(owned) => match owned.pending.take() {
                Some(row) => Poll::Ready(Some(row)),
                None => owned.rows.poll_recv(cx),
            },
        }
    }
}

impl std::fmt::Debug for RowCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

async fn drain_rows<B: Backend>(
    backend: Arc<B>,
    mut connection: B::Connection,
    command: PreparedCommand,
    sink: mpsc::Sender<Result<Row, SqlHelperError>>,
) -> Result<(), SqlHelperError> {
    {
        let mut rows = connection.fetch_rows(command);
        while let Some(row) = rows.next().await {
            let failed = row.is_err();
            if sink.send(row).await.is_err() || failed {
                break;
            }
        }
    }
    trace!("releasing cursor connection");
    backend.close(connection).await
}

async fn join_worker(
    worker: JoinHandle<Result<(), SqlHelperError>>,
) -> Result<(), SqlHelperError> {
    worker
        .await
        .map_err(|e| SqlHelperError::Execution(format!("cursor worker failed: {}", e)))?
}
