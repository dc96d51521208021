use bytes::Bytes;
use caskdb::{
  db::Engine,
  option::{IteratorOptions, Options, WriteBatchOptions},
  util::rand_kv::{get_test_key, get_test_value},
};
use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;
use tempfile::TempDir;

const PRELOADED_KEYS: usize = 100000;

fn open_engine(preload: bool) -> (TempDir, Engine) {
  let dir = tempfile::tempdir().unwrap();
  let option = Options {
    dir_path: dir.path().join("caskdb-bench"),
    ..Default::default()
  };
  let engine = Engine::open(option).unwrap();

  if preload {
    for i in 0..PRELOADED_KEYS {
      engine.put(get_test_key(i), get_test_value(i)).unwrap();
    }
  }
  (dir, engine)
}

fn bench_put(c: &mut Criterion) {
  let (_dir, engine) = open_engine(false);
  let mut rnd = rand::rng();

  c.bench_function("caskdb-put-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      let res = engine.put(get_test_key(i), get_test_value(i));
      assert!(res.is_ok());
    })
  });
}

fn bench_get(c: &mut Criterion) {
  let (_dir, engine) = open_engine(true);
  let mut rnd = rand::rng();

  c.bench_function("caskdb-get-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..PRELOADED_KEYS * 2);
      let res = engine.get(get_test_key(i));
      if i < PRELOADED_KEYS {
        assert!(res.is_ok());
      } else {
        assert!(res.is_err());
      }
    })
  });
}

fn bench_delete(c: &mut Criterion) {
  let (_dir, engine) = open_engine(true);
  let mut rnd = rand::rng();

  c.bench_function("caskdb-delete-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      engine.delete(get_test_key(i)).unwrap();
    })
  });
}

fn bench_batch_commit(c: &mut Criterion) {
  let (_dir, engine) = open_engine(false);
  let mut rnd = rand::rng();
  let opts = WriteBatchOptions {
    max_batch_num: 100,
    sync_writes: false,
  };

  c.bench_function("caskdb-batch-commit-bench", |b| {
    b.iter(|| {
      let wb = engine.new_write_batch(opts.clone()).unwrap();
      for _ in 0..100 {
        let i = rnd.random_range(0..u32::MAX) as usize;
        wb.put(get_test_key(i), get_test_value(i)).unwrap();
      }
      wb.commit().unwrap();
    })
  });
}

fn bench_listkeys(c: &mut Criterion) {
  let (_dir, engine) = open_engine(true);

  c.bench_function("caskdb-listkeys-bench", |b| {
    b.iter(|| {
      let res = engine.list_keys();
      assert!(res.is_ok());
    })
  });
}

fn bench_prefix_iter(c: &mut Criterion) {
  let (_dir, engine) = open_engine(true);

  c.bench_function("caskdb-prefix-iter-bench", |b| {
    b.iter(|| {
      let iter = engine
        .iter(IteratorOptions {
          prefix: get_test_key(999)[..19].to_vec(),
          reverse: false,
        })
        .unwrap();
      let mut total = 0;
      while iter.valid() {
        let value: Bytes = iter.value().unwrap();
        total += value.len();
        iter.next();
      }
      assert!(total > 0);
    })
  });
}

fn bench_stat(c: &mut Criterion) {
  let (_dir, engine) = open_engine(true);

  c.bench_function("caskdb-stat-bench", |b| {
    b.iter(|| {
      let res = engine.stat();
      assert!(res.is_ok());
    })
  });
}

criterion_group!(
  benches,
  bench_get,
  bench_put,
  bench_delete,
  bench_batch_commit,
  bench_listkeys,
  bench_prefix_iter,
  bench_stat
);
criterion_main!(benches);
