//! Application data-access seam.
//!
//! A session never touches application data directly: every `observe`,
//! `get`, `request` and `event` goes through the [`Dao`] produced for it by
//! the server's [`DaoFactory`] from the client's credentials.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rdao_core::{DaoError, Observable, Path};
use serde_json::Value;

/// Data-access object serving one session.
#[async_trait]
pub trait Dao: Send + Sync {
    /// Live cell for `what`. Called once per server-side observation.
    fn observable(&self, what: &Path) -> Result<Arc<dyn Observable>, DaoError>;

    /// Current value of `what`.
    async fn get(&self, what: &Path) -> Result<Value, DaoError>;

    /// Invoke the method at `method`.
    async fn request(&self, method: &Path, args: Vec<Value>) -> Result<Value, DaoError>;

    /// Release resources once the owning session has closed.
    fn dispose(&self) {}
}

/// Produces a [`Dao`] from the credentials in `initializeSession`.
///
/// A failure is reported to the client as `authenticationError` and ends
/// the session.
#[async_trait]
pub trait DaoFactory: Send + Sync + 'static {
    /// Build the data-access object for one session.
    async fn create(&self, credentials: Value) -> Result<Arc<dyn Dao>, DaoError>;
}

#[async_trait]
impl<F, Fut> DaoFactory for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Dao>, DaoError>> + Send + 'static,
{
    async fn create(&self, credentials: Value) -> Result<Arc<dyn Dao>, DaoError> {
        (self)(credentials).await
    }
}

/// Factory handing every session the same DAO, ignoring credentials.
///
/// Sessions closing do not dispose the shared DAO.
pub fn shared_dao(dao: Arc<dyn Dao>) -> impl DaoFactory {
    move |_credentials: Value| {
        let dao: Arc<dyn Dao> = Arc::new(Shared(dao.clone()));
        async move { Ok::<_, DaoError>(dao) }
    }
}

struct Shared(Arc<dyn Dao>);

#[async_trait]
impl Dao for Shared {
    fn observable(&self, what: &Path) -> Result<Arc<dyn Observable>, DaoError> {
        self.0.observable(what)
    }

    async fn get(&self, what: &Path) -> Result<Value, DaoError> {
        self.0.get(what).await
    }

    async fn request(&self, method: &Path, args: Vec<Value>) -> Result<Value, DaoError> {
        self.0.request(method, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdao_core::ObservableValue;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Dao for Echo {
        fn observable(&self, what: &Path) -> Result<Arc<dyn Observable>, DaoError> {
            Ok(Arc::new(ObservableValue::new(what.value().clone())))
        }

        async fn get(&self, what: &Path) -> Result<Value, DaoError> {
            Ok(what.value().clone())
        }

        async fn request(&self, _method: &Path, args: Vec<Value>) -> Result<Value, DaoError> {
            Ok(Value::Array(args))
        }
    }

    #[tokio::test]
    async fn closure_factory_sees_credentials() {
        let factory = |credentials: Value| async move {
            if credentials["token"] == "ok" {
                Ok(Arc::new(Echo) as Arc<dyn Dao>)
            } else {
                Err(DaoError::Rejected(json!("bad token")))
            }
        };
        assert!(factory.create(json!({"token": "ok"})).await.is_ok());
        let err = factory.create(json!({"token": "nope"})).await.err().unwrap();
        assert_eq!(err.payload(), json!("bad token"));
    }

    struct Counted(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl Dao for Counted {
        fn observable(&self, what: &Path) -> Result<Arc<dyn Observable>, DaoError> {
            Err(DaoError::NotFound(what.clone()))
        }

        async fn get(&self, _what: &Path) -> Result<Value, DaoError> {
            Ok(json!(self.0.load(std::sync::atomic::Ordering::SeqCst)))
        }

        async fn request(&self, _method: &Path, _args: Vec<Value>) -> Result<Value, DaoError> {
            Ok(json!(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1))
        }

        fn dispose(&self) {
            panic!("shared dao must not be disposed by a session");
        }
    }

    #[tokio::test]
    async fn shared_factory_reuses_instance() {
        let factory = shared_dao(Arc::new(Counted(std::sync::atomic::AtomicUsize::new(0))));
        let a = factory.create(Value::Null).await.unwrap();
        let b = factory.create(json!({"any": 1})).await.unwrap();
        let method = Path::from_segments(["inc"]);
        assert_eq!(a.request(&method, Vec::new()).await.unwrap(), json!(1));
        assert_eq!(b.request(&method, Vec::new()).await.unwrap(), json!(2));
        assert_eq!(a.get(&method).await.unwrap(), json!(2));
        a.dispose();
        assert_matches::assert_matches!(b.observable(&method), Err(DaoError::NotFound(_)));
    }
}
