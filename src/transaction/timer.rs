use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
struct TimerKey {
    execute_at: Instant,
    task_id: u64,
}

struct TimerState<T> {
    tasks: BTreeMap<TimerKey, T>,
    id_to_tasks: HashMap<u64, Instant>,
    last_task_id: u64,
}

/// Ordered timer wheel polled by the endpoint. Ids are never reused, so a
/// stale id cancels nothing.
pub struct Timer<T> {
    state: Mutex<TimerState<T>>,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            state: Mutex::new(TimerState {
                tasks: BTreeMap::new(),
                id_to_tasks: HashMap::new(),
                last_task_id: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.last_task_id += 1;
        let task_id = state.last_task_id;
        state.tasks.insert(
            TimerKey {
                execute_at,
                task_id,
            },
            value,
        );
        state.id_to_tasks.insert(task_id, execute_at);
        task_id
    }

    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        let execute_at = state.id_to_tasks.remove(&task_id)?;
        state.tasks.remove(&TimerKey {
            execute_at,
            task_id,
        })
    }

    /// Removes and returns every task due at `now`, earliest first.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        let due = state
            .tasks
            .range(
                ..=TimerKey {
                    execute_at: now,
                    task_id: u64::MAX,
                },
            )
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        let mut result = Vec::with_capacity(due.len());
        for key in due {
            state.id_to_tasks.remove(&key.task_id);
            if let Some(value) = state.tasks.remove(&key) {
                result.push(value);
            }
        }
        result
    }
}

#[test]
fn test_timer() {
    let timer = Timer::new();
    let now = Instant::now();
    let task_id = timer.timeout_at(now, "task1");
    assert_eq!(task_id, 1);
    assert_eq!(timer.cancel(task_id), Some("task1"));
    assert_eq!(timer.cancel(task_id), None);

    timer.timeout_at(now, "task2");
    timer.timeout_at(now, "task2b");
    let due = timer.poll(now + Duration::from_secs(1));
    assert_eq!(due, vec!["task2", "task2b"]);

    timer.timeout_at(now + Duration::from_millis(1001), "task3");
    let non_tasks = timer.poll(now + Duration::from_secs(1));
    assert_eq!(non_tasks.len(), 0);
    assert_eq!(timer.len(), 1);
}
