fn main() -> anyhow::Result<()> {
    tapfill_lib::run()
}
