#![allow(dead_code)]

use distmm::{ProcessGroup, ProcessGroupBuilder, SocketsArch};

/// Run `f` on every PE of an in-process group, one thread per PE, returning the results in rank order
pub fn run_threaded<T, F>(num_pes: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ProcessGroup) -> T + Sync,
{
    let groups = ProcessGroupBuilder::build_threaded(num_pes).unwrap();
    std::thread::scope(|s| {
        let handles = groups
            .into_iter()
            .map(|group| {
                let f = &f;
                s.spawn(move || f(group))
            })
            .collect::<Vec<_>>();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Like [run_threaded] but every PE joins a sockets group on the loopback interface
pub fn run_sockets<T, F>(num_pes: usize, port: u16, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ProcessGroup) -> T + Sync,
{
    let job_id = rand::random();
    std::thread::scope(|s| {
        let handles = (0..num_pes)
            .map(|pe| {
                let f = &f;
                s.spawn(move || {
                    let arch = SocketsArch::new(pe, num_pes, job_id, &[], port).unwrap();
                    let group = ProcessGroupBuilder::new()
                        .with_sockets_arch(arch)
                        .build()
                        .unwrap();
                    f(group)
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
