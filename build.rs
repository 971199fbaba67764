//! Stamps the build date shown by `lanetrace --version`.

fn main() {
    println!("cargo:rerun-if-env-changed=LANETRACE_BUILD_DATE");
    let date = std::env::var("LANETRACE_BUILD_DATE").unwrap_or_else(|_| {
        let today = time::OffsetDateTime::now_utc().date();
        format!("{}-{:02}-{:02}", today.year(), u8::from(today.month()), today.day())
    });
    println!("cargo:rustc-env=LANETRACE_BUILD_DATE={date}");
}
