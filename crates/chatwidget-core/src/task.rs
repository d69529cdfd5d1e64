//! Cancellable in-flight work whose state is dropped by the canceller, not on the next poll.
//!
//! `futures::future::abortable` only flags the task; the wrapped future (and every guard, timer
//! and subscription it owns) lives until the executor polls it again. [`cancellable`] keeps the
//! future in a shared slot so [`TaskHandle::cancel`] can drop it on the spot.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use futures::FutureExt;
use futures::future::{Aborted, LocalBoxFuture};

struct Slot<T> {
    future: RefCell<Option<LocalBoxFuture<'static, T>>>,
    cancelled: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

trait Cancel {
    fn cancel(&self);
}

impl<T> Cancel for Slot<T> {
    fn cancel(&self) {
        self.cancelled.set(true);
        // Taken first so drops that re-enter the runtime never see the slot borrowed.
        let future = self.future.borrow_mut().take();
        drop(future);
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Cancels the paired [`Cancellable`]. Holds no strong reference to the work.
pub(crate) struct TaskHandle {
    slot: Weak<dyn Cancel>,
}

impl TaskHandle {
    /// Drops the pending future immediately. When called from inside that future's own poll,
    /// the future is dropped as soon as the poll returns.
    pub(crate) fn cancel(self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.cancel();
        }
    }
}

/// Resolves to the wrapped future's output, or `Err(Aborted)` once cancelled.
pub(crate) struct Cancellable<T> {
    slot: Rc<Slot<T>>,
}

pub(crate) fn cancellable<T: 'static>(
    future: impl Future<Output = T> + 'static,
) -> (Cancellable<T>, TaskHandle) {
    let slot = Rc::new(Slot {
        future: RefCell::new(Some(future.boxed_local())),
        cancelled: Cell::new(false),
        waker: RefCell::new(None),
    });
    let weak: Weak<Slot<T>> = Rc::downgrade(&slot);
    let handle = TaskHandle { slot: weak };
    (Cancellable { slot }, handle)
}

impl<T> Future for Cancellable<T> {
    type Output = Result<T, Aborted>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let slot = &self.slot;
        if slot.cancelled.get() {
            return Poll::Ready(Err(Aborted));
        }
        let taken = slot.future.borrow_mut().take();
        let Some(mut future) = taken else {
            return Poll::Ready(Err(Aborted));
        };
        match future.as_mut().poll(cx) {
            Poll::Ready(output) => Poll::Ready(Ok(output)),
            Poll::Pending if slot.cancelled.get() => {
                drop(future);
                Poll::Ready(Err(Aborted))
            }
            Poll::Pending => {
                *slot.future.borrow_mut() = Some(future);
                *slot.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_work_before_any_poll() {
        let dropped = Rc::new(Cell::new(false));
        let flag = DropFlag(Rc::clone(&dropped));
        let (task, handle) = cancellable(async move {
            let _flag = flag;
            tokio::time::sleep(Duration::from_secs(60)).await;
            7
        });
        let mut task = Box::pin(task);
        assert!(futures::poll!(task.as_mut()).is_pending());
        assert!(!dropped.get());

        handle.cancel();
        assert!(dropped.get());
        assert_eq!(task.await, Err(Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_work_reports_its_output() {
        let (task, handle) = cancellable(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            "done"
        });
        assert_eq!(task.await, Ok("done"));
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_from_inside_the_work_stops_it_after_the_poll() {
        let handle_slot: Rc<RefCell<Option<TaskHandle>>> = Rc::new(RefCell::new(None));
        let inner_slot = Rc::clone(&handle_slot);
        let (task, handle) = cancellable(async move {
            if let Some(handle) = inner_slot.borrow_mut().take() {
                handle.cancel();
            }
            futures::future::pending::<()>().await;
        });
        *handle_slot.borrow_mut() = Some(handle);
        assert_eq!(task.await, Err(Aborted));
    }
}
