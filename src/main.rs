use torrkit::{bootstrap, console};

fn main() -> anyhow::Result<()> {
    bootstrap::logging::setup();
    console::run()
}
