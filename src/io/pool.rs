use parking_lot::Mutex;

/// Thread-safe object pool with `get`/`put` semantics.
///
/// Objects handed out by `get` are constructed on demand when the pool is
/// empty; `put` makes an object available for reuse. The pool is unbounded,
/// so its steady-state size tracks peak concurrent demand.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    init: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> Pool<T> {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            items: Mutex::new(Vec::new()),
            init: Box::new(init),
        }
    }

    /// Take an object from the pool, constructing a fresh one if none is
    /// available.
    pub fn get(&self) -> T {
        let recycled = self.items.lock().pop();
        recycled.unwrap_or_else(|| (self.init)())
    }

    /// Return an object to the pool for future reuse.
    pub fn put(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Number of idle objects currently held by the pool.
    pub fn idle(&self) -> usize {
        self.items.lock().len()
    }
}
