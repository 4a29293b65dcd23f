use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    toolrelay::cli::main()
}
