// Version of the build, set by the build script from the package
// version and the current git commit hash
pub const VERSION: &str = env!("BUILD_VERSION");
