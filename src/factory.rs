//! Maps (class name, args, queue) to a handler object. The core treats the
//! factory as opaque; resolving a class name to a concrete constructor in
//! the host environment is the factory's business, not the engine's.

use serde_json::Value;

use crate::error::{Error, Result};

/// The user-supplied object that actually performs a job.
pub trait Handler: Send {
    fn set_up(&mut self) -> Result<()> {
        Ok(())
    }

    fn perform(&mut self) -> std::result::Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>;

    fn tear_down(&mut self) -> Result<()> {
        Ok(())
    }
}

type Constructor = Box<dyn Fn(Value, &str) -> Box<dyn Handler> + Send + Sync>;

/// Handlers register themselves by a stable string identifier at process
/// start; the factory is then just a lookup table from that identifier to
/// a constructor closure. A producer in another language/process only
/// needs to agree on the identifier.
#[derive(Default)]
pub struct Factory {
    constructors: std::collections::HashMap<String, Constructor>,
}

impl Factory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        class: impl Into<String>,
        constructor: impl Fn(Value, &str) -> Box<dyn Handler> + Send + Sync + 'static,
    ) {
        self.constructors.insert(class.into(), Box::new(constructor));
    }

    pub fn create(&self, class: &str, args: Value, queue: &str) -> Result<Box<dyn Handler>> {
        self.constructors
            .get(class)
            .map(|ctor| ctor(args, queue))
            .ok_or_else(|| Error::FactoryError(class.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(Value);
    impl Handler for Echo {
        fn perform(&mut self) -> std::result::Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Some(self.0.clone()))
        }
    }

    #[test]
    fn resolves_a_registered_class() {
        let mut factory = Factory::new();
        factory.register("Echo", |args, _queue| Box::new(Echo(args)));

        let mut handler = factory.create("Echo", json!({"x": 1}), "default").unwrap();
        let result = handler.perform().unwrap();
        assert_eq!(result, Some(json!({"x": 1})));
    }

    #[test]
    fn unknown_class_is_a_factory_error() {
        let factory = Factory::new();
        match factory.create("Nope", json!(null), "default") {
            Err(Error::FactoryError(class)) => assert_eq!(class, "Nope"),
            other => panic!("expected FactoryError, got {:?}", other.map(|_| ())),
        }
    }
}
