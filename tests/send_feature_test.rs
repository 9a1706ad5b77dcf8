/// Test that the send feature works with tokio::spawn (requires Send)
/// This test will FAIL to compile if the driver future breaks Send requirements

#[cfg(feature = "send")]
#[tokio::test]
async fn test_send_feature_with_tokio_spawn() {
    use std::sync::{Arc, Mutex};
    use writable_streams::{StreamError, WritableSink, WritableStream};

    #[derive(Clone)]
    struct CollectingSink {
        chunks: Arc<Mutex<Vec<i32>>>,
    }

    impl WritableSink<i32> for CollectingSink {
        async fn write(
            &mut self,
            chunk: i32,
            _controller: &mut writable_streams::WritableStreamDefaultController,
        ) -> Result<(), StreamError> {
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }
    }

    let sink = CollectingSink {
        chunks: Arc::new(Mutex::new(Vec::new())),
    };
    let chunks = Arc::clone(&sink.chunks);

    // tokio::spawn requires Send, so if the driver future loses it, this
    // won't compile
    let stream = WritableStream::builder(sink)
        .spawn(tokio::spawn)
        .expect("failed to build stream");

    let (_locked, writer) = stream.get_writer().expect("failed to get writer");

    // The writer itself must also be Send to cross task boundaries
    let producer = tokio::spawn(async move {
        for value in [1, 2, 3] {
            writer.write(value).await.expect("write failed");
        }
        writer.close().await.expect("close failed");
    });
    producer.await.expect("producer task failed");

    assert_eq!(chunks.lock().unwrap().clone(), vec![1, 2, 3]);
}
