//! A fail-fast task queue which runs at most `concurrency` tasks at once.
//!
//! Tasks are started in the order they are given. Each task receives a
//! [ProgressReporter] which it can use to publish progress while it runs; all
//! progress is funnelled back to a single [QueueObserver], alongside a
//! notification for every task which completes.
//!
//! The queue is driven by the future returned from [TaskQueue::run]: the
//! running tasks and the progress channel are polled from that one future, so
//! observer callbacks never run concurrently with each other.
//!
//! # Example
//!
//! ```
//! use cobalt_s3_upload::queue::{ProgressReporter, TaskQueue};
//! use std::num::NonZeroUsize;
//!
//! # tokio_test::block_on(async {
//! let tasks = (1..=5).map(|n| {
//!     move |_progress: ProgressReporter<()>| async move { Ok::<_, std::io::Error>(n * 10) }
//! });
//! let queue = TaskQueue::new(NonZeroUsize::new(2).unwrap());
//! let results = queue.run(tasks, &mut ()).await.unwrap();
//! assert_eq!(results, vec![10, 20, 30, 40, 50]);
//! # })
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::num::NonZeroUsize;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::instrument;

/// The first failure of a queue run.
#[derive(Debug, Error)]
#[error("Task {index} failed")]
pub struct QueueError<E> {
    /// Position of the failed task in the submitted list.
    pub index: usize,
    #[source]
    pub source: E,
}

/// Progress published by a task, tagged with the task's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress<P> {
    pub index: usize,
    pub progress: P,
}

/// Handle given to each task to publish progress.
#[derive(Debug)]
pub struct ProgressReporter<P> {
    index: usize,
    sender: Option<UnboundedSender<(usize, P)>>,
}

impl<P> Clone for ProgressReporter<P> {
    fn clone(&self) -> Self {
        ProgressReporter {
            index: self.index,
            sender: self.sender.clone(),
        }
    }
}

impl<P> ProgressReporter<P> {
    pub fn new(index: usize, sender: UnboundedSender<(usize, P)>) -> Self {
        ProgressReporter {
            index,
            sender: Some(sender),
        }
    }

    /// A reporter which drops everything it is given.
    pub fn detached() -> Self {
        ProgressReporter {
            index: 0,
            sender: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn report(&self, progress: P) {
        if let Some(sender) = &self.sender {
            // The receiver only goes away once the run is over.
            let _ = sender.send((self.index, progress));
        }
    }
}

/// Receives the events of a queue run.
pub trait QueueObserver<R, P> {
    /// Called with the result of each task the moment it succeeds, in
    /// completion order. Not called for results which arrive after a failure.
    fn after_each(&mut self, _index: usize, _result: &R) {}

    /// Called for every progress event published by a running task.
    fn on_progress(&mut self, _event: TaskProgress<P>) {}
}

impl<R, P> QueueObserver<R, P> for () {}

/// Runs tasks with bounded concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskQueue {
    concurrency: NonZeroUsize,
}

impl Default for TaskQueue {
    fn default() -> Self {
        TaskQueue::sequential()
    }
}

impl TaskQueue {
    pub fn new(concurrency: NonZeroUsize) -> Self {
        TaskQueue { concurrency }
    }

    /// A queue which runs one task at a time.
    pub fn sequential() -> Self {
        TaskQueue {
            concurrency: NonZeroUsize::MIN,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.get()
    }

    /// Run every task and collect their results in submission order.
    ///
    /// Whenever a task finishes the next task which has not been started is
    /// launched, keeping at most `concurrency` tasks in flight. The returned
    /// future only resolves once every started task has settled.
    ///
    /// ## Failure
    ///
    /// The first task to fail stops the queue from starting any more tasks.
    /// Tasks which are already running are not cancelled; they are driven to
    /// completion and their results discarded. The error of the first failed
    /// task is then returned. A run never produces a partial success.
    #[instrument(skip_all, fields(concurrency = self.concurrency.get()))]
    pub async fn run<I, F, Fut, R, E, P, O>(
        &self,
        tasks: I,
        observer: &mut O,
    ) -> Result<Vec<R>, QueueError<E>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(ProgressReporter<P>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Debug,
        O: QueueObserver<R, P> + ?Sized,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut backlog = tasks.into_iter().enumerate();
        let mut running = FuturesUnordered::new();
        let mut results = BTreeMap::new();
        let mut failure: Option<QueueError<E>> = None;

        for (index, task) in backlog.by_ref().take(self.concurrency.get()) {
            running.push(launch(index, task, &sender));
        }

        while !running.is_empty() {
            tokio::select! {
                biased;
                Some((index, progress)) = receiver.recv() => {
                    observer.on_progress(TaskProgress { index, progress });
                }
                Some((index, result)) = running.next() => {
                    // Deliver anything the task published before it settled.
                    while let Ok((index, progress)) = receiver.try_recv() {
                        observer.on_progress(TaskProgress { index, progress });
                    }
                    let failed = failure.is_some();
                    match result {
                        Ok(value) if !failed => {
                            tracing::debug!(index, "Task completed");
                            observer.after_each(index, &value);
                            results.insert(index, value);
                        }
                        Ok(_) => {
                            tracing::debug!(index, "Discarding result of task which completed after a failure");
                        }
                        Err(source) if !failed => {
                            tracing::warn!(index, error = ?source, "Task failed, no further tasks will be started");
                            failure = Some(QueueError { index, source });
                        }
                        Err(source) => {
                            tracing::warn!(index, error = ?source, "Discarding error of task which failed after an earlier failure");
                        }
                    }
                    if failure.is_none() {
                        if let Some((index, task)) = backlog.next() {
                            running.push(launch(index, task, &sender));
                        }
                    }
                }
            }
        }

        while let Ok((index, progress)) = receiver.try_recv() {
            observer.on_progress(TaskProgress { index, progress });
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(results.into_values().collect()),
        }
    }
}

fn launch<F, Fut, R, E, P>(
    index: usize,
    task: F,
    sender: &UnboundedSender<(usize, P)>,
) -> impl Future<Output = (usize, Result<R, E>)>
where
    F: FnOnce(ProgressReporter<P>) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let future = task(ProgressReporter::new(index, sender.clone()));
    async move { (index, future.await) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::{prop_assert, prop_assert_eq};
    use std::cell::{Cell, RefCell};
    use std::pin::Pin;
    use std::rc::Rc;
    use test_strategy::proptest;

    #[derive(Debug, Error, PartialEq, Eq)]
    #[error("task {0} failed")]
    struct Failed(usize);

    type TaskFuture = Pin<Box<dyn Future<Output = Result<usize, Failed>>>>;

    #[derive(Debug, Default)]
    struct Recorder {
        completed: Vec<usize>,
        progress: Vec<TaskProgress<u64>>,
    }

    impl QueueObserver<usize, u64> for Recorder {
        fn after_each(&mut self, index: usize, result: &usize) {
            assert_eq!(index, *result);
            self.completed.push(index);
        }

        fn on_progress(&mut self, event: TaskProgress<u64>) {
            self.progress.push(event);
        }
    }

    #[derive(Debug, Default)]
    struct Activity {
        active: Cell<usize>,
        max_active: Cell<usize>,
        started: RefCell<Vec<usize>>,
        finished: RefCell<Vec<usize>>,
    }

    async fn yield_times(n: usize) {
        for _ in 0..n {
            tokio::task::yield_now().await;
        }
    }

    /// A task that yields `yields` times and then returns its index, or fails
    /// if `fail` is set.
    fn task(
        activity: Rc<Activity>,
        index: usize,
        yields: usize,
        fail: bool,
    ) -> impl FnOnce(ProgressReporter<u64>) -> TaskFuture {
        move |progress: ProgressReporter<u64>| -> TaskFuture {
            Box::pin(async move {
                activity.started.borrow_mut().push(index);
                activity.active.set(activity.active.get() + 1);
                activity
                    .max_active
                    .set(activity.max_active.get().max(activity.active.get()));
                progress.report(1);
                yield_times(yields).await;
                progress.report(2);
                activity.active.set(activity.active.get() - 1);
                activity.finished.borrow_mut().push(index);
                if fail {
                    Err(Failed(index))
                } else {
                    Ok(index)
                }
            })
        }
    }

    fn queue(concurrency: usize) -> TaskQueue {
        TaskQueue::new(NonZeroUsize::new(concurrency).unwrap())
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let tasks: Vec<fn(ProgressReporter<u64>) -> std::future::Ready<Result<usize, Failed>>> =
            vec![];
        let results = queue(3).run(tasks, &mut ()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_when_concurrency_is_one() {
        let activity = Rc::new(Activity::default());
        let tasks: Vec<_> = [3, 0, 1, 2]
            .into_iter()
            .enumerate()
            .map(|(i, yields)| task(activity.clone(), i, yields, false))
            .collect();

        let mut recorder = Recorder::default();
        let results = TaskQueue::sequential()
            .run(tasks, &mut recorder)
            .await
            .unwrap();

        assert_eq!(results, vec![0, 1, 2, 3]);
        assert_eq!(activity.max_active.get(), 1);
        assert_eq!(*activity.finished.borrow(), vec![0, 1, 2, 3]);
        assert_eq!(recorder.completed, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_after_each_runs_in_completion_order() {
        let activity = Rc::new(Activity::default());
        let tasks: Vec<_> = [5, 0, 2]
            .into_iter()
            .enumerate()
            .map(|(i, yields)| task(activity.clone(), i, yields, false))
            .collect();

        let mut recorder = Recorder::default();
        let results = queue(3).run(tasks, &mut recorder).await.unwrap();

        assert_eq!(results, vec![0, 1, 2]);
        assert_eq!(recorder.completed, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_progress_is_tagged_with_the_task() {
        let activity = Rc::new(Activity::default());
        let tasks: Vec<_> = (0..4)
            .map(|i| task(activity.clone(), i, i, false))
            .collect();

        let mut recorder = Recorder::default();
        queue(2).run(tasks, &mut recorder).await.unwrap();

        assert_eq!(recorder.progress.len(), 8);
        for index in 0..4 {
            let events: Vec<u64> = recorder
                .progress
                .iter()
                .filter(|e| e.index == index)
                .map(|e| e.progress)
                .collect();
            assert_eq!(events, vec![1, 2]);
        }
    }

    #[tokio::test]
    async fn test_failure_stops_new_tasks_and_drains_running_ones() {
        let activity = Rc::new(Activity::default());
        let tasks = vec![
            task(activity.clone(), 0, 10, false),
            task(activity.clone(), 1, 0, true),
            task(activity.clone(), 2, 0, false),
            task(activity.clone(), 3, 0, false),
        ];

        let mut recorder = Recorder::default();
        let err = queue(2).run(tasks, &mut recorder).await.unwrap_err();

        assert_eq!(err.index, 1);
        assert_eq!(err.source, Failed(1));
        // Task 0 was in flight, so it ran to completion but was discarded.
        assert_eq!(*activity.started.borrow(), vec![0, 1]);
        assert!(activity.finished.borrow().contains(&0));
        assert!(recorder.completed.is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_is_reported() {
        let activity = Rc::new(Activity::default());
        let tasks = vec![
            task(activity.clone(), 0, 4, true),
            task(activity.clone(), 1, 1, true),
            task(activity.clone(), 2, 0, false),
        ];

        let err = queue(3).run(tasks, &mut ()).await.unwrap_err();
        assert_matches!(err, QueueError { index: 1, source: Failed(1) });
        assert_eq!(activity.finished.borrow().len(), 3);
    }

    #[proptest(async = "tokio")]
    async fn test_bounded_concurrency(
        #[strategy(proptest::collection::vec(0_usize..6, 1..24))] yields: Vec<usize>,
        #[strategy(1..=#yields.len())] concurrency: usize,
    ) {
        let activity = Rc::new(Activity::default());
        let tasks: Vec<_> = yields
            .iter()
            .enumerate()
            .map(|(i, yields)| task(activity.clone(), i, *yields, false))
            .collect();

        let mut recorder = Recorder::default();
        let results = queue(concurrency).run(tasks, &mut recorder).await?;

        prop_assert!(activity.max_active.get() <= concurrency);
        prop_assert_eq!(results, (0..yields.len()).collect::<Vec<_>>());
        let mut completed = recorder.completed.clone();
        completed.sort_unstable();
        prop_assert_eq!(completed, (0..yields.len()).collect::<Vec<_>>());
        // Tasks are started in submission order.
        prop_assert_eq!(
            activity.started.borrow().clone(),
            (0..yields.len()).collect::<Vec<_>>()
        );
    }

    #[proptest(async = "tokio")]
    async fn test_fails_iff_a_task_fails(
        #[strategy(proptest::collection::vec((0_usize..4, proptest::bool::weighted(0.2)), 1..16))]
        tasks: Vec<(usize, bool)>,
        #[strategy(1..=#tasks.len())] concurrency: usize,
    ) {
        let activity = Rc::new(Activity::default());
        let queued: Vec<_> = tasks
            .iter()
            .enumerate()
            .map(|(i, (yields, fail))| task(activity.clone(), i, *yields, *fail))
            .collect();

        let result = queue(concurrency).run(queued, &mut ()).await;

        let any_failed = tasks.iter().any(|(_, fail)| *fail);
        prop_assert_eq!(result.is_err(), any_failed);
        if let Err(err) = result {
            prop_assert!(tasks[err.index].1);
            prop_assert_eq!(err.source, Failed(err.index));
        }
        // Every started task settled before the run resolved.
        prop_assert_eq!(activity.active.get(), 0);
    }
}
