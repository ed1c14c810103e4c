mod selftest;

fn main() {
    enginetest::cli::main(selftest::suite)
}
