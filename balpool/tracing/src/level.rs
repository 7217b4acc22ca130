use balpool_error::Error;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Clone)]
pub struct Handle(reload::Handle<EnvFilter, Registry>);

impl Handle {
    pub(crate) fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self(handle)
    }

    pub fn set_level(&self, level: impl AsRef<str>) -> Result<(), Error> {
        let level = level.as_ref();
        let filter = level.parse::<EnvFilter>()?;
        self.0.reload(filter)?;
        super::update_max_level();
        tracing::info!(%level, "set new log level");
        Ok(())
    }

    pub fn current(&self) -> Result<String, Error> {
        self.0
            .with_current(|f| format!("{}", f))
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use crate::Settings;

    #[test]
    fn reloads_level() {
        let (_dispatch, handle) = Settings::for_test("warn".into(), "plain".into()).build();
        let level = handle.level().expect("level handle must be set");
        assert_eq!(level.current().unwrap(), "warn");

        level.set_level("balpool=debug").unwrap();
        assert_eq!(level.current().unwrap(), "balpool=debug");

        assert!(level.set_level("balpool=notalevel").is_err());
    }
}
