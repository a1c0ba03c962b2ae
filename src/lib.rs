pub mod addr;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod link;
pub mod sensor;
pub mod server;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
