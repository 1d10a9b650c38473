use std::{
    io::{self, BufRead},
    sync::mpsc,
    thread,
};

/// Reports when the operator asks to stop, by pressing return or closing
/// stdin.
///
/// Stdin is read on its own thread, so the thread running a test is never
/// blocked on the terminal; it either polls [`StopSignal::requested`] from
/// its loop or parks in [`StopSignal::wait`] while the DMA engine works.
pub(crate) struct StopSignal {
    rx: mpsc::Receiver<()>,
    stopped: bool,
}

impl StopSignal {
    pub(crate) fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("stdin".into())
            .spawn(move || Self::read_stdin(tx))?;
        Ok(Self { rx, stopped: false })
    }

    fn read_stdin(tx: mpsc::Sender<()>) {
        let mut stdin = io::stdin().lock();
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => tracing::debug!("stdin closed"),
            Ok(_) => tracing::debug!("stop requested"),
            Err(error) => tracing::warn!(%error, "failed to read stdin"),
        }
        // the receiver may already be gone if the test ended on its own.
        let _ = tx.send(());
    }

    /// Returns `true` once a stop has been requested. This never blocks.
    pub(crate) fn requested(&mut self) -> bool {
        if !self.stopped {
            self.stopped = match self.rx.try_recv() {
                Ok(()) => true,
                Err(mpsc::TryRecvError::Empty) => false,
                Err(mpsc::TryRecvError::Disconnected) => true,
            };
        }
        self.stopped
    }

    /// Blocks until a stop is requested.
    pub(crate) fn wait(&mut self) {
        if !self.stopped {
            // a disconnect means the reader is gone, which is as good a
            // reason as any to stop.
            let _ = self.rx.recv();
            self.stopped = true;
        }
    }
}
