mod common;

use asupersync::runtime::RuntimeBuilder;
use asupersync::types::CancelKind;
use common::{Model, blog_post_ids, post_blog, post_comment_ids, unwrap_outcome};
use querybuf::{
    AsyncRelatedEntitiesLoader, Cx, EntityRef, Error, IncludeKeyComparer, InMemoryStateManager,
    Navigation, QueryBuffer, QueryContextDependencies, RelatedEntitiesLoader, RelatedStream,
    RowsLoader,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Counting {
    inner: RowsLoader,
    calls: Arc<AtomicUsize>,
}

impl RelatedEntitiesLoader for Counting {
    fn load(&mut self, comparer: IncludeKeyComparer) -> RelatedStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        RelatedEntitiesLoader::load(&mut self.inner, comparer)
    }
}

fn path(model: &Model) -> Vec<Arc<Navigation>> {
    vec![
        Arc::clone(&model.blog_posts),
        Arc::clone(&model.post_comments),
    ]
}

fn post_rows(model: &Model) -> RowsLoader {
    RowsLoader::new(vec![
        model.post_row(Some(10), 1, "first"),
        model.post_row(Some(20), 2, "other blog"),
        model.post_row(Some(11), 1, "second"),
    ])
}

fn comment_rows(model: &Model) -> RowsLoader {
    RowsLoader::new(vec![
        model.comment_row(100, 10),
        model.comment_row(200, 20),
        model.comment_row(101, 10),
    ])
}

fn blog(buffer: &mut QueryBuffer, model: &Model, id: i64) -> EntityRef {
    buffer
        .get_entity(model.blog_key(), &model.blog_row(id, "b"), false, true)
        .unwrap()
        .unwrap()
}

#[test]
fn nested_path_is_loaded_per_entity() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
    let blog = blog(&mut buffer, &model, 1);

    let post_calls = Arc::new(AtomicUsize::new(0));
    let comment_calls = Arc::new(AtomicUsize::new(0));
    let mut loaders: Vec<Box<dyn RelatedEntitiesLoader>> = vec![
        Box::new(Counting {
            inner: post_rows(&model),
            calls: Arc::clone(&post_calls),
        }),
        Box::new(Counting {
            inner: comment_rows(&model),
            calls: Arc::clone(&comment_calls),
        }),
    ];

    buffer
        .include(Some(&blog), &path(&model), &mut loaders, false)
        .unwrap();

    assert_eq!(blog_post_ids(&blog), Some(vec![10, 11]));
    let posts = common::read_posts(&blog);
    assert_eq!(post_comment_ids(&posts[0]), Some(vec![100, 101]));
    assert_eq!(post_comment_ids(&posts[1]), Some(vec![]));
    for post in &posts {
        assert!(Arc::ptr_eq(&post_blog(post).unwrap(), &blog));
    }

    assert_eq!(post_calls.load(Ordering::SeqCst), 1);
    assert_eq!(comment_calls.load(Ordering::SeqCst), 2);
    assert_eq!(model.posts_built.load(Ordering::SeqCst), 2);
    assert_eq!(model.comments_built.load(Ordering::SeqCst), 2);
}

#[test]
fn reused_entities_come_from_the_identity_map() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
    let blog = blog(&mut buffer, &model, 1);
    let post = buffer
        .get_entity(model.post_key(), &model.post_row(Some(10), 1, "first"), false, true)
        .unwrap()
        .unwrap();

    let mut loaders: Vec<Box<dyn RelatedEntitiesLoader>> = vec![Box::new(post_rows(&model))];
    buffer
        .include(
            Some(&blog),
            &[Arc::clone(&model.blog_posts)],
            &mut loaders,
            false,
        )
        .unwrap();

    assert!(Arc::ptr_eq(&common::read_posts(&blog)[0], &post));
    assert_eq!(model.posts_built.load(Ordering::SeqCst), 2);
}

#[test]
fn loader_count_must_match_path() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
    let blog = blog(&mut buffer, &model, 1);

    let mut loaders: Vec<Box<dyn RelatedEntitiesLoader>> = vec![Box::new(post_rows(&model))];
    let err = buffer
        .include(Some(&blog), &path(&model), &mut loaders, false)
        .unwrap_err();

    assert!(matches!(err, Error::Metadata(_)));
    assert_eq!(blog_post_ids(&blog), None);
}

#[test]
fn missing_entity_is_a_no_op() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));

    let calls = Arc::new(AtomicUsize::new(0));
    let mut loaders: Vec<Box<dyn RelatedEntitiesLoader>> = vec![
        Box::new(Counting {
            inner: post_rows(&model),
            calls: Arc::clone(&calls),
        }),
        Box::new(comment_rows(&model)),
    ];

    buffer.include(None, &path(&model), &mut loaders, false).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.suspend_count(), 0);
}

#[test]
fn tracked_include_suspends_once_per_fixup() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
    let blog = blog(&mut buffer, &model, 1);
    buffer.start_tracking(&blog, &model.blog).unwrap();

    let mut loaders: Vec<Box<dyn RelatedEntitiesLoader>> =
        vec![Box::new(post_rows(&model)), Box::new(comment_rows(&model))];
    buffer
        .include(Some(&blog), &path(&model), &mut loaders, true)
        .unwrap();

    // One fixup for the blog, one per post.
    assert_eq!(store.suspend_count(), 3);
    assert_eq!(store.resume_count(), 3);
    assert!(!store.is_suspended());
    assert!(store.entry(&blog).unwrap().is_loaded("posts"));
}

#[test]
fn async_include_matches_sync_result() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
    let blog = blog(&mut buffer, &model, 1);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut loaders: Vec<Box<dyn AsyncRelatedEntitiesLoader>> =
            vec![Box::new(post_rows(&model)), Box::new(comment_rows(&model))];
        let outcome = buffer
            .include_async(&cx, Some(&blog), &path(&model), &mut loaders, false)
            .await;
        unwrap_outcome(outcome);
    });

    assert_eq!(blog_post_ids(&blog), Some(vec![10, 11]));
    let posts = common::read_posts(&blog);
    assert_eq!(post_comment_ids(&posts[0]), Some(vec![100, 101]));
    assert_eq!(post_comment_ids(&posts[1]), Some(vec![]));
}

#[test]
fn async_loader_count_must_match_path() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
    let blog = blog(&mut buffer, &model, 1);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut loaders: Vec<Box<dyn AsyncRelatedEntitiesLoader>> = Vec::new();
        let outcome = buffer
            .include_async(&cx, Some(&blog), &path(&model), &mut loaders, false)
            .await;
        assert!(matches!(outcome, querybuf::Outcome::Err(Error::Metadata(_))));
    });
}

#[test]
fn cancelled_async_include_leaves_entity_unassigned() {
    let model = Model::new();
    let store = Arc::new(InMemoryStateManager::new());
    let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
    let blog = blog(&mut buffer, &model, 1);
    buffer.start_tracking(&blog, &model.blog).unwrap();

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    cx.cancel_with(CancelKind::User, Some("query aborted"));

    rt.block_on(async {
        let mut loaders: Vec<Box<dyn AsyncRelatedEntitiesLoader>> =
            vec![Box::new(post_rows(&model)), Box::new(comment_rows(&model))];
        let outcome = buffer
            .include_async(&cx, Some(&blog), &path(&model), &mut loaders, true)
            .await;
        assert!(matches!(outcome, querybuf::Outcome::Cancelled(_)));
    });

    assert_eq!(blog_post_ids(&blog), None);
    assert_eq!(model.posts_built.load(Ordering::SeqCst), 0);
    assert_eq!(store.suspend_count(), 0);
    assert!(!store.is_suspended());
}
